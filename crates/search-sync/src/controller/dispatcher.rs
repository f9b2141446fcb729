use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
  select, spawn,
  sync::{Mutex, Semaphore},
  task::{JoinError, JoinHandle, JoinSet},
  time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, InboundMessage, MessageBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  Unsubscribed,
  Subscribed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("subject {0} is already bound")]
  AlreadyBound(String),
  #[error("dispatcher is shutting down, cannot bind {0}")]
  ShuttingDown(String),
  #[error(transparent)]
  Bus(#[from] BusError),
}

/// Invoked once per delivery. Returning means the delivery is handled.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
  async fn handle(&self, msg: InboundMessage);
}

pub struct DispatcherArgs {
  pub bus: Arc<dyn MessageBus>,
  pub max_in_flight: usize,
  /// Fired when the grace period runs out; in-flight handlers are abandoned
  pub cancel_in_flight: CancellationToken,
}

struct Binding {
  state: SubscriptionState,
  receiver: Option<JoinHandle<Box<dyn Subscription>>>,
}

/// Binds subjects to handlers and runs every delivery as its own task.
///
/// No ordering is imposed between deliveries, not even for the same subject or
/// the same entity id. A per-id sequencer (striped lock or single-writer actor
/// keyed by id) could be added in front of `MessageHandler::handle` without
/// changing this contract.
pub struct Dispatcher {
  bus: Arc<dyn MessageBus>,
  bindings: Mutex<HashMap<String, Binding>>,
  semaphore: Arc<Semaphore>,
  in_flight: Arc<Mutex<JoinSet<()>>>,
  stop_receiving: CancellationToken,
  cancel_in_flight: CancellationToken,
}

impl Dispatcher {
  pub fn new(args: DispatcherArgs) -> Self {
    Self {
      bus: args.bus,
      bindings: Mutex::new(HashMap::new()),
      semaphore: Arc::new(Semaphore::new(args.max_in_flight.max(1))),
      in_flight: Arc::new(Mutex::new(JoinSet::new())),
      stop_receiving: CancellationToken::new(),
      cancel_in_flight: args.cancel_in_flight,
    }
  }

  /// Subscribe to `subject` and start delivering its messages to `handler`.
  /// Any error here means the subject will never be synchronized.
  pub async fn bind(
    &self,
    subject: &str,
    handler: Arc<dyn MessageHandler>,
  ) -> Result<(), DispatchError> {
    if self.stop_receiving.is_cancelled() {
      return Err(DispatchError::ShuttingDown(subject.to_string()));
    }

    let mut bindings = self.bindings.lock().await;
    if bindings.get(subject).is_some_and(|b| b.state == SubscriptionState::Subscribed) {
      return Err(DispatchError::AlreadyBound(subject.to_string()));
    }

    let subscription = self.bus.subscribe(subject).await?;
    let receiver = spawn(receive_loop(ReceiveLoop {
      subscription,
      handler,
      semaphore: self.semaphore.clone(),
      in_flight: self.in_flight.clone(),
      stop: self.stop_receiving.clone(),
      cancel: self.cancel_in_flight.clone(),
    }));

    bindings.insert(
      subject.to_string(),
      Binding { state: SubscriptionState::Subscribed, receiver: Some(receiver) },
    );
    info!("Bound handler to {}", subject);
    Ok(())
  }

  pub async fn state(&self, subject: &str) -> SubscriptionState {
    self
      .bindings
      .lock()
      .await
      .get(subject)
      .map(|b| b.state)
      .unwrap_or(SubscriptionState::Unsubscribed)
  }

  pub async fn subjects(&self) -> Vec<String> {
    let mut subjects: Vec<String> = self.bindings.lock().await.keys().cloned().collect();
    subjects.sort();
    subjects
  }

  /// Stop receiving, drain in-flight handlers for up to `grace`, flush
  /// acknowledgements, then unsubscribe every binding.
  pub async fn shutdown(&self, grace: Duration) -> Result<(), BusError> {
    self.stop_receiving.cancel();

    let receivers: Vec<(String, JoinHandle<Box<dyn Subscription>>)> = {
      let mut bindings = self.bindings.lock().await;
      bindings
        .iter_mut()
        .filter_map(|(subject, b)| b.receiver.take().map(|r| (subject.clone(), r)))
        .collect()
    };

    let mut subscriptions = Vec::with_capacity(receivers.len());
    for (subject, receiver) in receivers {
      match receiver.await {
        Ok(subscription) => subscriptions.push((subject, subscription)),
        Err(err) => error!("Receive loop for {} ended abnormally: {}", subject, err),
      }
    }
    info!("Stopped receiving. Draining in-flight handlers...");

    self.drain(grace).await;

    let flushed = self.bus.flush().await;
    if let Err(err) = &flushed {
      error!("Failed to flush acknowledgements: {}", err);
    }

    for (subject, subscription) in subscriptions {
      if let Err(err) = subscription.unsubscribe().await {
        error!("Failed to unsubscribe from {}: {}", subject, err);
      }
    }

    let mut bindings = self.bindings.lock().await;
    for binding in bindings.values_mut() {
      binding.state = SubscriptionState::Unsubscribed;
    }
    info!("Dispatcher stopped");

    flushed
  }

  async fn drain(&self, grace: Duration) {
    let deadline = Instant::now() + grace;
    let mut set = self.in_flight.lock().await;

    loop {
      if set.is_empty() {
        info!("All in-flight handlers finished");
        break;
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        warn!("Grace period elapsed with {} handlers in flight, abandoning them", set.len());
        self.cancel_in_flight.cancel();
        set.abort_all();
        while let Some(res) = set.join_next().await {
          report(res);
        }
        break;
      }

      match timeout(remaining, set.join_next()).await {
        Ok(Some(res)) => report(res),
        Ok(None) => break,
        Err(_) => continue,
      }
    }
  }
}

fn report(res: Result<(), JoinError>) {
  if let Err(err) = res {
    if err.is_panic() {
      error!("Handler task panicked: {}", err);
    }
  }
}

struct ReceiveLoop {
  subscription: Box<dyn Subscription>,
  handler: Arc<dyn MessageHandler>,
  semaphore: Arc<Semaphore>,
  in_flight: Arc<Mutex<JoinSet<()>>>,
  stop: CancellationToken,
  cancel: CancellationToken,
}

/// Returns the subscription so it can be released after the final flush
async fn receive_loop(args: ReceiveLoop) -> Box<dyn Subscription> {
  let ReceiveLoop { mut subscription, handler, semaphore, in_flight, stop, cancel } = args;
  let subject = subscription.subject().to_string();
  let acker = subscription.acker();

  loop {
    select! {
      biased;
      _ = stop.cancelled() => {
        debug!("Receive loop for {} stopping", subject);
        break;
      }
      next = subscription.next_message() => {
        match next {
          None => {
            warn!("Subscription to {} was closed by the bus", subject);
            break;
          }
          Some(Err(err)) => {
            error!("{}", err);
            select! {
              _ = stop.cancelled() => break,
              _ = sleep(Duration::from_secs(1)) => {}
            }
          }
          Some(Ok(msg)) => {
            let permit = semaphore.clone().acquire_owned();
            let handler = handler.clone();
            let acker = acker.clone();
            let cancel = cancel.clone();

            let mut set = in_flight.lock().await;
            while let Some(res) = set.try_join_next() {
              report(res);
            }

            set.spawn(async move {
              let tag = msg.tag.clone();
              let handled = select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = async {
                  let Ok(_permit) = permit.await else {
                    error!("Semaphore closed unexpectedly");
                    return;
                  };
                  handler.handle(msg).await;
                } => true,
              };

              if handled {
                acker.ack(&tag).await;
              } else {
                debug!("Abandoned {}[{}] @ {}", tag.topic, tag.partition, tag.offset);
              }
            });
          }
        }
      }
    }
  }

  subscription
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedSender},
    Barrier,
  };

  use super::*;
  use crate::bus::memory::MemoryBus;

  const WAIT: Duration = Duration::from_secs(5);

  struct Recording {
    seen: UnboundedSender<Vec<u8>>,
  }

  #[async_trait]
  impl MessageHandler for Recording {
    async fn handle(&self, msg: InboundMessage) {
      if msg.payload == b"panic" {
        panic!("handler blew up");
      }
      let _ = self.seen.send(msg.payload);
    }
  }

  struct Blocking {
    barrier: Arc<Barrier>,
    done: AtomicUsize,
  }

  #[async_trait]
  impl MessageHandler for Blocking {
    async fn handle(&self, _msg: InboundMessage) {
      self.barrier.wait().await;
      self.done.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct Stuck;

  #[async_trait]
  impl MessageHandler for Stuck {
    async fn handle(&self, _msg: InboundMessage) {
      std::future::pending::<()>().await;
    }
  }

  fn dispatcher(bus: &MemoryBus, max_in_flight: usize) -> Dispatcher {
    Dispatcher::new(DispatcherArgs {
      bus: Arc::new(bus.clone()),
      max_in_flight,
      cancel_in_flight: CancellationToken::new(),
    })
  }

  #[tokio::test]
  async fn binding_twice_is_rejected() {
    let bus = MemoryBus::new();
    let dispatcher = dispatcher(&bus, 4);
    let (tx, _rx) = unbounded_channel();
    let handler = Arc::new(Recording { seen: tx });

    dispatcher.bind("users.created", handler.clone()).await.unwrap();
    let err = dispatcher.bind("users.created", handler).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyBound(subject) if subject == "users.created"));
    assert_eq!(dispatcher.state("users.created").await, SubscriptionState::Subscribed);
  }

  #[tokio::test]
  async fn subscribe_failure_is_returned() {
    let bus = MemoryBus::new();
    bus.fail_subscribe("posts.deleted");
    let dispatcher = dispatcher(&bus, 4);
    let (tx, _rx) = unbounded_channel();

    let err = dispatcher.bind("posts.deleted", Arc::new(Recording { seen: tx })).await;
    assert!(matches!(err, Err(DispatchError::Bus(BusError::Subscribe { .. }))));
    assert_eq!(dispatcher.state("posts.deleted").await, SubscriptionState::Unsubscribed);
  }

  #[tokio::test]
  async fn deliveries_on_one_subject_run_concurrently() {
    let bus = MemoryBus::new();
    let dispatcher = dispatcher(&bus, 4);
    let handler =
      Arc::new(Blocking { barrier: Arc::new(Barrier::new(2)), done: AtomicUsize::new(0) });
    dispatcher.bind("users.updated", handler.clone()).await.unwrap();

    bus.publish("users.updated", b"{}".to_vec()).unwrap();
    bus.publish("users.updated", b"{}".to_vec()).unwrap();

    // each handler waits for the other, so this only finishes if both run at once
    timeout(WAIT, async {
      while handler.done.load(Ordering::SeqCst) < 2 {
        sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn shutdown_flushes_acks_and_unsubscribes() {
    let bus = MemoryBus::new();
    let dispatcher = dispatcher(&bus, 4);
    let (tx, mut rx) = unbounded_channel();
    dispatcher.bind("posts.upsert", Arc::new(Recording { seen: tx })).await.unwrap();

    let tag = bus.publish("posts.upsert", b"one".to_vec()).unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"one");

    dispatcher.shutdown(WAIT).await.unwrap();
    assert_eq!(bus.flushed(), vec![tag]);
    assert_eq!(bus.unsubscribed(), vec!["posts.upsert".to_string()]);
    assert_eq!(dispatcher.state("posts.upsert").await, SubscriptionState::Unsubscribed);

    let (tx, _rx) = unbounded_channel();
    let err = dispatcher.bind("posts.upsert", Arc::new(Recording { seen: tx })).await;
    assert!(matches!(err, Err(DispatchError::ShuttingDown(_))));
  }

  #[tokio::test]
  async fn stuck_handlers_are_abandoned_after_grace() {
    let bus = MemoryBus::new();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(DispatcherArgs {
      bus: Arc::new(bus.clone()),
      max_in_flight: 4,
      cancel_in_flight: cancel.clone(),
    });
    dispatcher.bind("users.deleted", Arc::new(Stuck)).await.unwrap();
    bus.publish("users.deleted", b"{}".to_vec()).unwrap();
    sleep(Duration::from_millis(50)).await;

    timeout(WAIT, dispatcher.shutdown(Duration::from_millis(50))).await.unwrap().unwrap();
    assert!(cancel.is_cancelled());
    assert!(bus.acks().is_empty());
  }

  #[tokio::test]
  async fn handler_panic_is_contained() {
    let bus = MemoryBus::new();
    let dispatcher = dispatcher(&bus, 1);
    let (tx, mut rx) = unbounded_channel();
    dispatcher.bind("users.created", Arc::new(Recording { seen: tx })).await.unwrap();

    bus.publish("users.created", b"panic".to_vec()).unwrap();
    bus.publish("users.created", b"after".to_vec()).unwrap();

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"after");
    dispatcher.shutdown(WAIT).await.unwrap();
    assert_eq!(bus.flushed().len(), 1);
  }
}
