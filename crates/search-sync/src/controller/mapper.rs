use chrono::{DateTime, Utc};

use crate::models::{
  documents::{PostDocument, UserDocument},
  records::{PostRecord, UserRecord},
};

/// Whole seconds since the Unix epoch, sub-second part dropped.
pub fn epoch_seconds(ts: &DateTime<Utc>) -> i64 {
  ts.timestamp()
}

pub fn user_to_document(user: &UserRecord) -> UserDocument {
  UserDocument {
    id: user.id.clone(),
    username: user.username.clone(),
    name: user.name.clone(),
    email: user.email.clone(),
    bio: user.bio.clone(),
    picture: user.picture.clone(),
    school: user.school.clone(),
    country: user.country.clone(),
    campus: user.campus.clone(),
    info_updated: user.info_updated,
    program: user.program.clone(),
    year: user.year,
    created_at: epoch_seconds(&user.created_at),
    updated_at: epoch_seconds(&user.updated_at),
  }
}

/// The author fields are copied as carried by the event; they are never looked up.
pub fn post_to_document(post: &PostRecord) -> PostDocument {
  PostDocument {
    id: post.id.clone(),
    user_id: post.user_id.clone(),
    user_name: post.username.clone(),
    user_picture: post.user_picture.clone(),
    user_bio: post.user_bio.clone(),
    user_programme: post.user_programme.clone(),
    user_year: post.user_year,
    user_campus: post.user_campus.clone(),
    subject: post.subject.clone(),
    title: post.title.clone(),
    content: post.content.clone(),
    images: post.images.clone(),
    created_at: epoch_seconds(&post.created_at),
    updated_at: epoch_seconds(&post.updated_at),
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;
  use crate::models::records::ZERO_TIME_SECS;

  fn post() -> PostRecord {
    serde_json::from_value(json!({
      "id": "p1",
      "user_id": "u1",
      "username": "alice",
      "user_picture": "a.png",
      "user_bio": "bio",
      "user_programme": "CS",
      "user_year": 3,
      "user_campus": "UTM",
      "subject": "MAT137",
      "title": "Help with proofs",
      "content": "...",
      "images": ["b.png", "a.png", "c.png"],
      "created_at": "2024-01-01T00:00:00.999Z",
      "updated_at": "2024-01-02T00:00:01Z"
    }))
    .unwrap()
  }

  #[test]
  fn timestamps_truncate_to_the_second() {
    let ts =
      Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(999);
    assert_eq!(epoch_seconds(&ts), 1_704_067_200);

    let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
    assert_eq!(epoch_seconds(&before_epoch), -1);
  }

  #[test]
  fn post_document_renames_author_fields_and_keeps_image_order() {
    let doc = post_to_document(&post());
    assert_eq!(doc.user_name, "alice");
    assert_eq!(doc.user_programme, "CS");
    assert_eq!(doc.user_year, 3);
    assert_eq!(doc.images, vec!["b.png", "a.png", "c.png"]);
    assert_eq!(doc.created_at, 1_704_067_200);
    assert_eq!(doc.updated_at, 1_704_153_601);
  }

  #[test]
  fn user_document_has_every_schema_key() {
    let user: UserRecord = serde_json::from_value(json!({ "id": "u1" })).unwrap();
    let value = serde_json::to_value(user_to_document(&user)).unwrap();
    let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort();

    let mut expected = vec![
      "id", "username", "name", "email", "bio", "picture", "school", "country", "campus",
      "info_updated", "program", "year", "created_at", "updated_at",
    ];
    expected.sort();
    assert_eq!(keys, expected);
    assert_eq!(value["year"], json!(0));
    assert_eq!(value["info_updated"], json!(false));
    assert_eq!(value["created_at"], json!(ZERO_TIME_SECS));
    assert_eq!(value["updated_at"], json!(-62_135_596_800_i64));
  }

  #[test]
  fn post_document_has_every_schema_key() {
    let record: PostRecord = serde_json::from_value(json!({ "id": "p1", "images": null })).unwrap();
    let value = serde_json::to_value(post_to_document(&record)).unwrap();
    assert_eq!(value.as_object().unwrap().len(), 14);
    assert_eq!(value["images"], json!([]));
    assert_eq!(value["user_name"], json!(""));
  }

  #[test]
  fn mapping_is_deterministic() {
    let record = post();
    let first = serde_json::to_vec(&post_to_document(&record)).unwrap();
    let second = serde_json::to_vec(&post_to_document(&record)).unwrap();
    assert_eq!(first, second);

    let user: UserRecord =
      serde_json::from_value(json!({ "id": "u1", "username": "alice", "year": 2 })).unwrap();
    assert_eq!(user_to_document(&user), user_to_document(&user));
  }
}
