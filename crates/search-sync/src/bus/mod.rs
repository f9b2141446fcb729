use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod kafka;
pub mod memory;

/// Position of a delivery in its stream, used to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
  pub topic: String,
  pub partition: i32,
  pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
  pub subject: String,
  pub payload: Vec<u8>,
  pub tag: DeliveryTag,
}

#[derive(Debug, Error)]
pub enum BusError {
  #[error("invalid bus credentials: {0}")]
  Credentials(String),
  #[error("failed to connect to the bus: {0}")]
  Connection(String),
  #[error("failed to subscribe to {subject}: {reason}")]
  Subscribe { subject: String, reason: String },
  #[error("failed to receive on {subject}: {reason}")]
  Receive { subject: String, reason: String },
  #[error("failed to commit acknowledgements: {0}")]
  Commit(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
  async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError>;

  /// Push every buffered acknowledgement to the bus. Called once on shutdown.
  async fn flush(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait Subscription: Send {
  fn subject(&self) -> &str;

  /// Next delivery, or `None` once the subscription is closed.
  async fn next_message(&mut self) -> Option<Result<InboundMessage, BusError>>;

  /// Handle that outlives the receive loop, for acknowledging from handler tasks
  fn acker(&self) -> Arc<dyn Acknowledger>;

  async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
  /// Mark a delivery as handled. Handled means done, whatever the outcome was.
  async fn ack(&self, tag: &DeliveryTag);
}
