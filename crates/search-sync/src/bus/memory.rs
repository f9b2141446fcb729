use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{Acknowledger, BusError, DeliveryTag, InboundMessage, MessageBus, Subscription};

#[derive(Default)]
struct State {
  senders: HashMap<String, UnboundedSender<InboundMessage>>,
  offsets: HashMap<String, i64>,
  pending_acks: Vec<DeliveryTag>,
  flushed_acks: Vec<DeliveryTag>,
  failing: HashSet<String>,
  unsubscribed: Vec<String>,
}

/// In-process bus. Deliveries published before a subscription exists are dropped.
#[derive(Clone, Default)]
pub struct MemoryBus {
  state: Arc<Mutex<State>>,
}

impl MemoryBus {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    lock(&self.state)
  }

  /// Deliver `payload` on `subject`; returns its tag, or `None` if nobody is subscribed
  pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Option<DeliveryTag> {
    let mut state = self.lock();
    let offset = state.offsets.entry(subject.to_string()).or_insert(-1);
    *offset += 1;
    let tag = DeliveryTag { topic: subject.to_string(), partition: 0, offset: *offset };

    let sender = state.senders.get(subject)?;
    let msg = InboundMessage { subject: subject.to_string(), payload: payload.into(), tag };
    let tag = msg.tag.clone();
    sender.send(msg).ok()?;
    Some(tag)
  }

  /// Make subscribing to `subject` fail
  pub fn fail_subscribe(&self, subject: &str) {
    self.lock().failing.insert(subject.to_string());
  }

  /// End every open subscription's stream
  pub fn close(&self) {
    self.lock().senders.clear();
  }

  /// Acknowledged deliveries, whether flushed or not
  pub fn acks(&self) -> Vec<DeliveryTag> {
    let state = self.lock();
    state.flushed_acks.iter().chain(state.pending_acks.iter()).cloned().collect()
  }

  pub fn flushed(&self) -> Vec<DeliveryTag> {
    self.lock().flushed_acks.clone()
  }

  pub fn unsubscribed(&self) -> Vec<String> {
    self.lock().unsubscribed.clone()
  }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
  state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageBus for MemoryBus {
  async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
    let mut state = self.lock();
    if state.failing.contains(subject) {
      return Err(BusError::Subscribe {
        subject: subject.to_string(),
        reason: "subscription refused".to_string(),
      });
    }

    let (tx, rx) = unbounded_channel();
    state.senders.insert(subject.to_string(), tx);
    Ok(Box::new(MemorySubscription {
      subject: subject.to_string(),
      rx,
      state: self.state.clone(),
    }))
  }

  async fn flush(&self) -> Result<(), BusError> {
    let mut state = self.lock();
    let pending = std::mem::take(&mut state.pending_acks);
    state.flushed_acks.extend(pending);
    Ok(())
  }
}

struct MemorySubscription {
  subject: String,
  rx: UnboundedReceiver<InboundMessage>,
  state: Arc<Mutex<State>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
  fn subject(&self) -> &str {
    &self.subject
  }

  async fn next_message(&mut self) -> Option<Result<InboundMessage, BusError>> {
    self.rx.recv().await.map(Ok)
  }

  fn acker(&self) -> Arc<dyn Acknowledger> {
    Arc::new(MemoryAcker { state: self.state.clone() })
  }

  async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
    let mut state = lock(&self.state);
    state.senders.remove(&self.subject);
    state.unsubscribed.push(self.subject.clone());
    Ok(())
  }
}

struct MemoryAcker {
  state: Arc<Mutex<State>>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
  async fn ack(&self, tag: &DeliveryTag) {
    lock(&self.state).pending_acks.push(tag.clone());
  }
}
