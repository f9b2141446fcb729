use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};

/// The closed set of payload shapes carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
  User,
  Post,
  Deletion,
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordKind::User => write!(f, "user"),
      RecordKind::Post => write!(f, "post"),
      RecordKind::Deletion => write!(f, "deletion"),
    }
  }
}

/// A record decoded from an inbound payload. Identity is always `id`.
pub trait Record: DeserializeOwned + Send {
  const KIND: RecordKind;

  fn id(&self) -> &str;
}

/// `null` is read as the field's zero value, same as an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de> + Default,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Seconds from the Unix epoch to 0001-01-01T00:00:00Z, the publishers' unset timestamp.
pub const ZERO_TIME_SECS: i64 = -62_135_596_800;

/// Zero value of a timestamp field
pub fn zero_time() -> DateTime<Utc> {
  DateTime::from_timestamp(ZERO_TIME_SECS, 0).unwrap_or_default()
}

/// Like `nullable`, with `zero_time` as the zero value.
fn nullable_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Option::<DateTime<Utc>>::deserialize(deserializer)?.unwrap_or_else(zero_time))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRecord {
  pub id: String,
  #[serde(default, deserialize_with = "nullable")]
  pub username: String,
  #[serde(default, deserialize_with = "nullable")]
  pub name: String,
  #[serde(default, deserialize_with = "nullable")]
  pub email: String,
  #[serde(default, deserialize_with = "nullable")]
  pub bio: String,
  #[serde(default, deserialize_with = "nullable")]
  pub picture: String,
  #[serde(default, deserialize_with = "nullable")]
  pub school: String,
  #[serde(default, deserialize_with = "nullable")]
  pub country: String,
  #[serde(default, deserialize_with = "nullable")]
  pub campus: String,
  #[serde(default, deserialize_with = "nullable")]
  pub info_updated: bool,
  #[serde(default, deserialize_with = "nullable")]
  pub program: String,
  #[serde(default, deserialize_with = "nullable")]
  pub year: i64,
  #[serde(default = "zero_time", deserialize_with = "nullable_time")]
  pub created_at: DateTime<Utc>,
  #[serde(default = "zero_time", deserialize_with = "nullable_time")]
  pub updated_at: DateTime<Utc>,
}

impl Record for UserRecord {
  const KIND: RecordKind = RecordKind::User;

  fn id(&self) -> &str {
    &self.id
  }
}

/// A post, with a point-in-time copy of its author's profile fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostRecord {
  pub id: String,
  #[serde(default, deserialize_with = "nullable")]
  pub user_id: String,
  #[serde(default, deserialize_with = "nullable")]
  pub username: String,
  #[serde(default, deserialize_with = "nullable")]
  pub user_picture: String,
  #[serde(default, deserialize_with = "nullable")]
  pub user_bio: String,
  #[serde(default, deserialize_with = "nullable")]
  pub user_programme: String,
  #[serde(default, deserialize_with = "nullable")]
  pub user_year: i64,
  #[serde(default, deserialize_with = "nullable")]
  pub user_campus: String,
  #[serde(default, deserialize_with = "nullable")]
  pub subject: String,
  #[serde(default, deserialize_with = "nullable")]
  pub title: String,
  #[serde(default, deserialize_with = "nullable")]
  pub content: String,
  #[serde(default, deserialize_with = "nullable")]
  pub images: Vec<String>,
  #[serde(default = "zero_time", deserialize_with = "nullable_time")]
  pub created_at: DateTime<Utc>,
  #[serde(default = "zero_time", deserialize_with = "nullable_time")]
  pub updated_at: DateTime<Utc>,
}

impl Record for PostRecord {
  const KIND: RecordKind = RecordKind::Post;

  fn id(&self) -> &str {
    &self.id
  }
}

/// Payload of the deletion subjects. Every field other than `id` is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletionReference {
  pub id: String,
}

impl Record for DeletionReference {
  const KIND: RecordKind = RecordKind::Deletion;

  fn id(&self) -> &str {
    &self.id
  }
}
