//! Apply side of the synchronizer: typed per-collection facade over a search backend.
//!
//! Documents are turned into loosely typed JSON objects only here, right before
//! they are handed to an [`IndexBackend`].

use std::{
  future::Future,
  marker::PhantomData,
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use exobook_config::Retry;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{models::documents::IndexDocument, server::observability::MetricsCollector};

pub mod memory;
pub mod typesense;

/// A document as the backend sees it
pub type Fields = Map<String, Value>;

#[derive(Debug, Error)]
pub enum IndexError {
  #[error("document {id} already exists in {collection}")]
  AlreadyExists { collection: String, id: String },
  #[error("document {id} not found in {collection}")]
  NotFound { collection: String, id: String },
  #[error("{collection} rejected the request: status={status}, message={message}")]
  Rejected { collection: String, status: u16, message: String },
  #[error("{collection} is unavailable: status={status}, message={message}")]
  Unavailable { collection: String, status: u16, message: String },
  #[error("request to {collection} failed: {source}")]
  Transport {
    collection: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("failed to encode document for {collection}: {source}")]
  Encode {
    collection: String,
    #[source]
    source: serde_json::Error,
  },
  #[error("request to {collection} was canceled")]
  Canceled { collection: String },
}

impl IndexError {
  /// Failures worth retrying: the same request may succeed later.
  pub fn is_transient(&self) -> bool {
    matches!(self, IndexError::Unavailable { .. } | IndexError::Transport { .. })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOperation {
  Create,
  Upsert,
  Delete,
  Get,
}

impl IndexOperation {
  pub fn as_str(&self) -> &'static str {
    match self {
      IndexOperation::Create => "create",
      IndexOperation::Upsert => "upsert",
      IndexOperation::Delete => "delete",
      IndexOperation::Get => "get",
    }
  }
}

/// Single-round-trip document operations of a search backend.
#[async_trait]
pub trait IndexBackend: Send + Sync {
  /// Fails with [`IndexError::AlreadyExists`] when the id is taken.
  async fn create(&self, collection: &str, document: &Fields) -> Result<(), IndexError>;

  /// Replaces any existing document with the same id wholesale.
  async fn upsert(&self, collection: &str, document: &Fields) -> Result<(), IndexError>;

  /// Fails with [`IndexError::NotFound`] when there is nothing to delete.
  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError>;

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>, IndexError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_backoff: Duration,
  pub max_backoff: Duration,
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self { max_attempts: 1, base_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
  }
}

impl From<&Retry> for RetryPolicy {
  fn from(retry: &Retry) -> Self {
    Self {
      max_attempts: retry.max_attempts.max(1),
      base_backoff: Duration::from_millis(retry.base_backoff_ms),
      max_backoff: Duration::from_millis(retry.max_backoff_ms),
    }
  }
}

pub struct IndexClientArgs {
  pub backend: Arc<dyn IndexBackend>,
  pub collection: String,
  pub retry: RetryPolicy,
  pub cancel: CancellationToken,
  pub metrics: Arc<MetricsCollector>,
}

/// create / upsert / delete for one entity kind against one named collection
pub struct IndexClient<D> {
  backend: Arc<dyn IndexBackend>,
  collection: String,
  retry: RetryPolicy,
  cancel: CancellationToken,
  metrics: Arc<MetricsCollector>,
  _document: PhantomData<fn(&D)>,
}

impl<D: IndexDocument> IndexClient<D> {
  pub fn new(args: IndexClientArgs) -> Self {
    Self {
      backend: args.backend,
      collection: args.collection,
      retry: args.retry,
      cancel: args.cancel,
      metrics: args.metrics,
      _document: PhantomData,
    }
  }

  pub async fn create(&self, document: &D) -> Result<(), IndexError> {
    let fields = self.to_fields(document)?;
    let (res, tries) = self
      .call_counted(IndexOperation::Create, || self.backend.create(&self.collection, &fields))
      .await;
    match res {
      // an earlier try landed but its response was lost
      Err(IndexError::AlreadyExists { .. }) if tries > 1 => {
        debug!("Create of {} in {} landed on an earlier try", document.id(), self.collection)
      }
      res => res?,
    }
    debug!("Created {} in {}", document.id(), self.collection);
    Ok(())
  }

  pub async fn upsert(&self, document: &D) -> Result<(), IndexError> {
    let fields = self.to_fields(document)?;
    self.call(IndexOperation::Upsert, || self.backend.upsert(&self.collection, &fields)).await?;
    debug!("Upserted {} in {}", document.id(), self.collection);
    Ok(())
  }

  pub async fn delete_by_id(&self, id: &str) -> Result<(), IndexError> {
    let (res, tries) =
      self.call_counted(IndexOperation::Delete, || self.backend.delete(&self.collection, id)).await;
    match res {
      Err(IndexError::NotFound { .. }) if tries > 1 => {
        debug!("Delete of {} in {} landed on an earlier try", id, self.collection);
        Ok(())
      }
      res => res,
    }
  }

  pub async fn get(&self, id: &str) -> Result<Option<Fields>, IndexError> {
    self.call(IndexOperation::Get, || self.backend.get(&self.collection, id)).await
  }

  fn to_fields(&self, document: &D) -> Result<Fields, IndexError> {
    let encode_err = |source| IndexError::Encode { collection: self.collection.clone(), source };
    match serde_json::to_value(document).map_err(encode_err)? {
      Value::Object(fields) => Ok(fields),
      other => Err(encode_err(<serde_json::Error as serde::ser::Error>::custom(format!(
        "document serialized to {} instead of an object",
        other
      )))),
    }
  }

  async fn call<T, F, Fut>(&self, operation: IndexOperation, op: F) -> Result<T, IndexError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, IndexError>>,
  {
    self.call_counted(operation, op).await.0
  }

  /// Run one backend call, retrying transient failures with capped exponential backoff.
  /// Every attempt and every backoff sleep is abandoned when the cancel token fires.
  /// Returns the outcome along with the number of tries made.
  async fn call_counted<T, F, Fut>(
    &self,
    operation: IndexOperation,
    op: F,
  ) -> (Result<T, IndexError>, u32)
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, IndexError>>,
  {
    let canceled = || IndexError::Canceled { collection: self.collection.clone() };
    let mut backoff = self.retry.base_backoff;
    let mut tries = 0;

    loop {
      tries += 1;
      let start = Instant::now();
      let result = select! {
        biased;
        _ = self.cancel.cancelled() => Err(canceled()),
        res = op() => res,
      };
      self.metrics.observe_index_duration(
        &self.collection,
        operation.as_str(),
        start.elapsed().as_secs_f64(),
      );

      match result {
        Err(err) if err.is_transient() && tries < self.retry.max_attempts => {
          warn!(
            "{} on {} failed (try {}/{}): {}",
            operation.as_str(),
            self.collection,
            tries,
            self.retry.max_attempts,
            err
          );
          self.metrics.record_index_retry(&self.collection);
          select! {
            biased;
            _ = self.cancel.cancelled() => return (Err(canceled()), tries),
            _ = sleep(backoff) => {}
          }
          backoff = backoff.saturating_mul(2).min(self.retry.max_backoff);
        }
        other => return (other, tries),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::json;

  use super::{memory::MemoryIndex, *};
  use crate::models::documents::UserDocument;

  fn user(id: &str, bio: &str) -> UserDocument {
    UserDocument {
      id: id.to_string(),
      username: "alice".to_string(),
      name: "Alice".to_string(),
      email: String::new(),
      bio: bio.to_string(),
      picture: String::new(),
      school: String::new(),
      country: String::new(),
      campus: String::new(),
      info_updated: false,
      program: String::new(),
      year: 2,
      created_at: 1_700_000_000,
      updated_at: 1_700_000_100,
    }
  }

  fn client(
    index: &MemoryIndex,
    retry: RetryPolicy,
    cancel: CancellationToken,
  ) -> IndexClient<UserDocument> {
    IndexClient::new(IndexClientArgs {
      backend: Arc::new(index.clone()),
      collection: "users".to_string(),
      retry,
      cancel,
      metrics: Arc::new(MetricsCollector::new().unwrap()),
    })
  }

  fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_backoff: Duration::from_millis(1),
      max_backoff: Duration::from_millis(2),
    }
  }

  #[tokio::test]
  async fn create_rejects_duplicates() {
    let index = MemoryIndex::new();
    let users = client(&index, RetryPolicy::none(), CancellationToken::new());

    users.create(&user("u1", "first")).await.unwrap();
    let err = users.create(&user("u1", "second")).await.unwrap_err();
    assert!(matches!(err, IndexError::AlreadyExists { ref id, .. } if id == "u1"));

    let stored = users.get("u1").await.unwrap().unwrap();
    assert_eq!(stored["bio"], json!("first"));
  }

  #[tokio::test]
  async fn upsert_twice_is_the_same_as_once() {
    let index = MemoryIndex::new();
    let users = client(&index, RetryPolicy::none(), CancellationToken::new());

    users.upsert(&user("u1", "bio")).await.unwrap();
    let once = index.snapshot("users");
    users.upsert(&user("u1", "bio")).await.unwrap();
    assert_eq!(index.snapshot("users"), once);
    assert_eq!(once.len(), 1);
  }

  #[tokio::test]
  async fn delete_then_lookup_reports_not_found() {
    let index = MemoryIndex::new();
    let users = client(&index, RetryPolicy::none(), CancellationToken::new());

    users.upsert(&user("u1", "bio")).await.unwrap();
    users.upsert(&user("u2", "bio")).await.unwrap();
    users.delete_by_id("u1").await.unwrap();

    assert!(users.get("u1").await.unwrap().is_none());
    assert!(users.get("u2").await.unwrap().is_some());

    let err = users.delete_by_id("u1").await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound { .. }));
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let index = MemoryIndex::new();
    index.fail_next(2, 503);
    let users = client(&index, fast_retry(3), CancellationToken::new());

    users.upsert(&user("u1", "bio")).await.unwrap();
    assert_eq!(index.call_count(), 3);
    assert!(index.snapshot("users").contains_key("u1"));
  }

  #[tokio::test]
  async fn retries_stop_at_max_attempts() {
    let index = MemoryIndex::new();
    index.fail_next(5, 502);
    let users = client(&index, fast_retry(3), CancellationToken::new());

    let err = users.upsert(&user("u1", "bio")).await.unwrap_err();
    assert!(matches!(err, IndexError::Unavailable { status: 502, .. }));
    assert_eq!(index.call_count(), 3);
  }

  #[tokio::test]
  async fn permanent_failures_are_not_retried() {
    let index = MemoryIndex::new();
    let users = client(&index, fast_retry(3), CancellationToken::new());

    let err = users.delete_by_id("ghost").await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound { .. }));
    assert_eq!(index.call_count(), 1);
  }

  #[tokio::test]
  async fn canceled_token_abandons_the_call() {
    let index = MemoryIndex::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let users = client(&index, RetryPolicy::none(), cancel);

    let err = users.upsert(&user("u1", "bio")).await.unwrap_err();
    assert!(matches!(err, IndexError::Canceled { .. }));
    assert!(index.snapshot("users").is_empty());
  }

  #[tokio::test]
  async fn cancel_during_backoff_abandons_the_retry() {
    let index = MemoryIndex::new();
    index.fail_next(5, 503);
    let cancel = CancellationToken::new();
    let retry = RetryPolicy {
      max_attempts: 5,
      base_backoff: Duration::from_secs(10),
      max_backoff: Duration::from_secs(10),
    };
    let users = client(&index, retry, cancel.clone());

    let canceller = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      cancel.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(2), users.upsert(&user("u1", "bio")))
      .await
      .expect("backoff sleep was not interrupted")
      .unwrap_err();
    assert!(matches!(err, IndexError::Canceled { .. }));
    assert_eq!(index.call_count(), 1);
    canceller.await.unwrap();
  }

  #[tokio::test]
  async fn retried_create_that_already_landed_succeeds() {
    let index = MemoryIndex::new();
    index.lose_next_responses(1);
    let users = client(&index, fast_retry(3), CancellationToken::new());

    users.create(&user("u1", "bio")).await.unwrap();
    assert_eq!(index.call_count(), 2);
    assert!(index.snapshot("users").contains_key("u1"));

    // without a lost response a duplicate is still reported
    let err = users.create(&user("u1", "bio")).await.unwrap_err();
    assert!(matches!(err, IndexError::AlreadyExists { .. }));
  }

  #[tokio::test]
  async fn retried_delete_that_already_landed_succeeds() {
    let index = MemoryIndex::new();
    let users = client(&index, fast_retry(3), CancellationToken::new());
    users.upsert(&user("u1", "bio")).await.unwrap();

    index.lose_next_responses(1);
    users.delete_by_id("u1").await.unwrap();
    assert!(index.snapshot("users").is_empty());
    assert_eq!(index.call_count(), 3);
  }

  #[test]
  fn retry_policy_from_settings() {
    let retry = Retry { max_attempts: 0, base_backoff_ms: 100, max_backoff_ms: 5000 };
    let policy = RetryPolicy::from(&retry);
    assert_eq!(policy.max_attempts, 1);
    assert_eq!(policy.base_backoff, Duration::from_millis(100));
    assert_eq!(policy.max_backoff, Duration::from_secs(5));
  }
}
