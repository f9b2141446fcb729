use serde_json::Value;
use thiserror::Error;

use crate::models::records::{Record, RecordKind};

/// A payload that could not be turned into a record. The message is dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("payload on {subject} ({size} bytes) is not valid JSON: {source}")]
  Malformed {
    subject: String,
    size: usize,
    #[source]
    source: serde_json::Error,
  },
  #[error("payload on {subject} ({size} bytes) is not a JSON object")]
  NotAnObject { subject: String, size: usize },
  #[error("payload on {subject} ({size} bytes) does not match the {kind} schema: {source}")]
  Schema {
    subject: String,
    size: usize,
    kind: RecordKind,
    #[source]
    source: serde_json::Error,
  },
  #[error("payload on {subject} ({size} bytes) has an empty id")]
  EmptyId { subject: String, size: usize },
}

impl DecodeError {
  pub fn subject(&self) -> &str {
    match self {
      DecodeError::Malformed { subject, .. }
      | DecodeError::NotAnObject { subject, .. }
      | DecodeError::Schema { subject, .. }
      | DecodeError::EmptyId { subject, .. } => subject,
    }
  }

  pub fn size(&self) -> usize {
    match self {
      DecodeError::Malformed { size, .. }
      | DecodeError::NotAnObject { size, .. }
      | DecodeError::Schema { size, .. }
      | DecodeError::EmptyId { size, .. } => *size,
    }
  }
}

/// Decode `payload` received on `subject` as a record of type `R`.
///
/// The payload must be a JSON object. Unknown fields are ignored and missing
/// optional fields take their zero value, but `id` must be present and non-empty.
pub fn decode<R: Record>(subject: &str, payload: &[u8]) -> Result<R, DecodeError> {
  let size = payload.len();

  let value: Value = serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed {
    subject: subject.to_string(),
    size,
    source,
  })?;

  // serde would happily read a struct out of a JSON array
  if !value.is_object() {
    return Err(DecodeError::NotAnObject { subject: subject.to_string(), size });
  }

  let record: R = serde_json::from_value(value).map_err(|source| DecodeError::Schema {
    subject: subject.to_string(),
    size,
    kind: R::KIND,
    source,
  })?;

  if record.id().trim().is_empty() {
    return Err(DecodeError::EmptyId { subject: subject.to_string(), size });
  }

  Ok(record)
}
