use std::{
  collections::{BTreeMap, HashMap, VecDeque},
  sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{Fields, IndexBackend, IndexError, IndexOperation};

#[derive(Default)]
struct State {
  collections: HashMap<String, BTreeMap<String, Fields>>,
  calls: Vec<(IndexOperation, String, String)>,
  failures: VecDeque<u16>,
  lost_responses: usize,
}

/// In-memory index with the same create/upsert/delete semantics as the HTTP backend.
///
/// Used by tests; cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryIndex {
  state: Arc<Mutex<State>>,
}

impl MemoryIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next `count` calls fail with `status` (reported as unavailable).
  pub fn fail_next(&self, count: usize, status: u16) {
    let mut state = self.lock();
    state.failures.extend(std::iter::repeat(status).take(count));
  }

  /// Apply the next `count` writes but answer them with a gateway timeout.
  pub fn lose_next_responses(&self, count: usize) {
    self.lock().lost_responses += count;
  }

  /// Number of calls received, including failed ones.
  pub fn call_count(&self) -> usize {
    self.lock().calls.len()
  }

  pub fn snapshot(&self, collection: &str) -> BTreeMap<String, Fields> {
    self.lock().collections.get(collection).cloned().unwrap_or_default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    // a test that panicked while holding the lock already failed
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn begin(
    &self,
    operation: IndexOperation,
    collection: &str,
    id: &str,
  ) -> Result<MutexGuard<'_, State>, IndexError> {
    let mut state = self.lock();
    state.calls.push((operation, collection.to_string(), id.to_string()));
    if let Some(status) = state.failures.pop_front() {
      return Err(IndexError::Unavailable {
        collection: collection.to_string(),
        status,
        message: "injected failure".to_string(),
      });
    }
    Ok(state)
  }
}

/// Answer a write that was applied
fn applied(mut state: MutexGuard<'_, State>, collection: &str) -> Result<(), IndexError> {
  if state.lost_responses > 0 {
    state.lost_responses -= 1;
    return Err(IndexError::Unavailable {
      collection: collection.to_string(),
      status: 504,
      message: "response lost".to_string(),
    });
  }
  Ok(())
}

fn document_id(collection: &str, document: &Fields) -> Result<String, IndexError> {
  match document.get("id").and_then(Value::as_str) {
    Some(id) if !id.is_empty() => Ok(id.to_string()),
    _ => Err(IndexError::Rejected {
      collection: collection.to_string(),
      status: 400,
      message: "document has no id".to_string(),
    }),
  }
}

#[async_trait]
impl IndexBackend for MemoryIndex {
  async fn create(&self, collection: &str, document: &Fields) -> Result<(), IndexError> {
    let id = document_id(collection, document)?;
    let mut state = self.begin(IndexOperation::Create, collection, &id)?;
    let docs = state.collections.entry(collection.to_string()).or_default();
    if docs.contains_key(&id) {
      return Err(IndexError::AlreadyExists { collection: collection.to_string(), id });
    }
    docs.insert(id, document.clone());
    applied(state, collection)
  }

  async fn upsert(&self, collection: &str, document: &Fields) -> Result<(), IndexError> {
    let id = document_id(collection, document)?;
    let mut state = self.begin(IndexOperation::Upsert, collection, &id)?;
    state.collections.entry(collection.to_string()).or_default().insert(id, document.clone());
    applied(state, collection)
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError> {
    let mut state = self.begin(IndexOperation::Delete, collection, id)?;
    let removed = state.collections.get_mut(collection).and_then(|docs| docs.remove(id));
    match removed {
      Some(_) => applied(state, collection),
      None => {
        Err(IndexError::NotFound { collection: collection.to_string(), id: id.to_string() })
      }
    }
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>, IndexError> {
    let state = self.begin(IndexOperation::Get, collection, id)?;
    Ok(state.collections.get(collection).and_then(|docs| docs.get(id)).cloned())
  }
}
