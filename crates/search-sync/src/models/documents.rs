use serde::Serialize;

/// A document in the flat schema of an index collection.
///
/// Every field is always present; the index schema has no optional keys.
pub trait IndexDocument: Serialize + Send + Sync {
  fn id(&self) -> &str;
}

/// Document stored in the users collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserDocument {
  pub id: String,
  pub username: String,
  pub name: String,
  pub email: String,
  pub bio: String,
  pub picture: String,
  pub school: String,
  pub country: String,
  pub campus: String,
  pub info_updated: bool,
  pub program: String,
  pub year: i64,
  /// Epoch seconds
  pub created_at: i64,
  /// Epoch seconds
  pub updated_at: i64,
}

impl IndexDocument for UserDocument {
  fn id(&self) -> &str {
    &self.id
  }
}

/// Document stored in the posts collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostDocument {
  pub id: String,
  pub user_id: String,
  pub user_name: String,
  pub user_picture: String,
  pub user_bio: String,
  pub user_programme: String,
  pub user_year: i64,
  pub user_campus: String,
  pub subject: String,
  pub title: String,
  pub content: String,
  pub images: Vec<String>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl IndexDocument for PostDocument {
  fn id(&self) -> &str {
    &self.id
  }
}
