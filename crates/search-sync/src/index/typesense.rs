use std::time::Duration;

use async_trait::async_trait;
use exobook_result::errors::{BoxedErr, ErrorType, InternalError};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use urlencoding::encode;

use super::{Fields, IndexBackend, IndexError, IndexOperation};

const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";

pub struct TypesenseBackendArgs {
  pub base_url: String,
  pub api_key: String,
  pub request_timeout: Duration,
  pub connect_timeout: Duration,
}

/// Typesense documents API over HTTP. One instance per Typesense server.
#[derive(Debug, Clone)]
pub struct TypesenseBackend {
  http: Client,
  base_url: String,
  api_key: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  message: String,
}

impl TypesenseBackend {
  pub fn new(args: TypesenseBackendArgs) -> Result<Self, BoxedErr> {
    let http = Client::builder()
      .timeout(args.request_timeout)
      .connect_timeout(args.connect_timeout)
      .pool_idle_timeout(Duration::from_secs(90))
      .pool_max_idle_per_host(10)
      .build()
      .map_err(|err| {
        let path = "search-sync.index.typesense.new".to_string();
        let msg = "failed to create http client".to_string();
        let err_type = ErrorType::HttpRequestError;
        InternalError { err_type, temp: false, err: Box::new(err), msg, path }
      })?;

    Ok(Self {
      http,
      base_url: args.base_url.trim_end_matches('/').to_string(),
      api_key: args.api_key,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn documents_url(&self, collection: &str) -> String {
    format!("{}/collections/{}/documents", self.base_url, encode(collection))
  }

  fn document_url(&self, collection: &str, id: &str) -> String {
    format!("{}/{}", self.documents_url(collection), encode(id))
  }

  fn request(&self, method: Method, url: &str) -> RequestBuilder {
    let req = self.http.request(method, url);
    if self.api_key.is_empty() {
      return req;
    }
    req.header(API_KEY_HEADER, &self.api_key)
  }

  async fn send(
    &self,
    req: RequestBuilder,
    operation: IndexOperation,
    collection: &str,
    id: &str,
  ) -> Result<Response, IndexError> {
    let resp = req
      .send()
      .await
      .map_err(|source| IndexError::Transport { collection: collection.to_string(), source })?;

    let status = resp.status();
    if status.is_success() {
      return Ok(resp);
    }

    let txt = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&txt).map(|b| b.message).unwrap_or(txt);
    Err(classify(operation, status, collection, id, message))
  }
}

fn classify(
  operation: IndexOperation,
  status: StatusCode,
  collection: &str,
  id: &str,
  message: String,
) -> IndexError {
  let collection = collection.to_string();
  match (status, operation) {
    (StatusCode::CONFLICT, IndexOperation::Create) => {
      IndexError::AlreadyExists { collection, id: id.to_string() }
    }
    (StatusCode::NOT_FOUND, IndexOperation::Delete | IndexOperation::Get) => {
      IndexError::NotFound { collection, id: id.to_string() }
    }
    (s, _) if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
      IndexError::Unavailable { collection, status: s.as_u16(), message }
    }
    (s, _) => IndexError::Rejected { collection, status: s.as_u16(), message },
  }
}

fn id_of(document: &Fields) -> &str {
  document.get("id").and_then(|v| v.as_str()).unwrap_or_default()
}

#[async_trait]
impl IndexBackend for TypesenseBackend {
  async fn create(&self, collection: &str, document: &Fields) -> Result<(), IndexError> {
    let req = self.request(Method::POST, &self.documents_url(collection)).json(document);
    self.send(req, IndexOperation::Create, collection, id_of(document)).await?;
    Ok(())
  }

  async fn upsert(&self, collection: &str, document: &Fields) -> Result<(), IndexError> {
    let req = self
      .request(Method::POST, &self.documents_url(collection))
      .query(&[("action", "upsert")])
      .json(document);
    self.send(req, IndexOperation::Upsert, collection, id_of(document)).await?;
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError> {
    let req = self.request(Method::DELETE, &self.document_url(collection, id));
    self.send(req, IndexOperation::Delete, collection, id).await?;
    Ok(())
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>, IndexError> {
    let req = self.request(Method::GET, &self.document_url(collection, id));
    let resp = match self.send(req, IndexOperation::Get, collection, id).await {
      Ok(resp) => resp,
      Err(IndexError::NotFound { .. }) => return Ok(None),
      Err(err) => return Err(err),
    };

    let status = resp.status().as_u16();
    let body = resp.bytes().await.map_err(|source| IndexError::Transport {
      collection: collection.to_string(),
      source,
    })?;
    // a body that is not a document will not become one on a retry
    let fields = serde_json::from_slice::<Fields>(&body).map_err(|err| IndexError::Rejected {
      collection: collection.to_string(),
      status,
      message: format!("invalid document body: {err}"),
    })?;
    Ok(Some(fields))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;

  fn backend(server: &MockServer, api_key: &str) -> TypesenseBackend {
    TypesenseBackend::new(TypesenseBackendArgs {
      base_url: format!("{}/", server.uri()),
      api_key: api_key.to_string(),
      request_timeout: Duration::from_secs(2),
      connect_timeout: Duration::from_secs(1),
    })
    .unwrap()
  }

  fn doc(id: &str) -> Fields {
    match json!({ "id": id, "username": "alice", "year": 2 }) {
      serde_json::Value::Object(map) => map,
      _ => unreachable!(),
    }
  }

  #[tokio::test]
  async fn create_posts_document_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/collections/users/documents"))
      .and(header(API_KEY_HEADER, "secret"))
      .and(body_json(json!({ "id": "u1", "username": "alice", "year": 2 })))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "u1" })))
      .expect(1)
      .mount(&server)
      .await;

    backend(&server, "secret").create("users", &doc("u1")).await.unwrap();
  }

  #[tokio::test]
  async fn create_conflict_maps_to_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/collections/users/documents"))
      .respond_with(
        ResponseTemplate::new(409)
          .set_body_json(json!({ "message": "A document with id u1 already exists." })),
      )
      .mount(&server)
      .await;

    let err = backend(&server, "k").create("users", &doc("u1")).await.unwrap_err();
    assert!(matches!(err, IndexError::AlreadyExists { ref id, .. } if id == "u1"));
  }

  #[tokio::test]
  async fn upsert_sets_action_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/collections/posts/documents"))
      .and(query_param("action", "upsert"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
      .expect(1)
      .mount(&server)
      .await;

    backend(&server, "k").upsert("posts", &doc("p1")).await.unwrap();
  }

  #[tokio::test]
  async fn delete_missing_document_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/collections/posts/documents/ghost"))
      .respond_with(
        ResponseTemplate::new(404)
          .set_body_json(json!({ "message": "Could not find a document with id: ghost" })),
      )
      .mount(&server)
      .await;

    let err = backend(&server, "k").delete("posts", "ghost").await.unwrap_err();
    assert!(matches!(err, IndexError::NotFound { ref id, .. } if id == "ghost"));
  }

  #[tokio::test]
  async fn ids_are_percent_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/collections/users/documents/a%2Fb%20c"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "a/b c" })))
      .expect(1)
      .mount(&server)
      .await;

    backend(&server, "k").delete("users", "a/b c").await.unwrap();
  }

  #[tokio::test]
  async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
      .mount(&server)
      .await;

    let err = backend(&server, "k").upsert("users", &doc("u1")).await.unwrap_err();
    assert!(err.is_transient());
    match err {
      IndexError::Unavailable { status, message, .. } => {
        assert_eq!(status, 503);
        assert_eq!(message, "overloaded");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn bad_request_is_rejected_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(400)
          .set_body_json(json!({ "message": "Field `year` must be an int32." })),
      )
      .mount(&server)
      .await;

    let err = backend(&server, "k").upsert("users", &doc("u1")).await.unwrap_err();
    assert!(!err.is_transient());
    match err {
      IndexError::Rejected { status, message, .. } => {
        assert_eq!(status, 400);
        assert!(message.contains("year"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn get_returns_none_when_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/collections/users/documents/u1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "u1", "year": 2 })))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/collections/users/documents/u2"))
      .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })))
      .mount(&server)
      .await;

    let ts = backend(&server, "k");
    let found = ts.get("users", "u1").await.unwrap().unwrap();
    assert_eq!(found["year"], json!(2));
    assert!(ts.get("users", "u2").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn undecodable_document_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/collections/users/documents/u1"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy page</html>"))
      .expect(1)
      .mount(&server)
      .await;

    let err = backend(&server, "k").get("users", "u1").await.unwrap_err();
    match &err {
      IndexError::Rejected { status, message, .. } => {
        assert_eq!(*status, 200);
        assert!(message.starts_with("invalid document body"));
      }
      other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_transient());
  }

  #[tokio::test]
  async fn unreachable_server_is_a_transport_error() {
    let ts = TypesenseBackend::new(TypesenseBackendArgs {
      base_url: "http://127.0.0.1:1".to_string(),
      api_key: String::new(),
      request_timeout: Duration::from_secs(1),
      connect_timeout: Duration::from_millis(200),
    })
    .unwrap();

    let err = ts.delete("users", "u1").await.unwrap_err();
    assert!(matches!(err, IndexError::Transport { .. }));
    assert!(err.is_transient());
  }

  #[test]
  fn trailing_slash_is_trimmed() {
    let ts = TypesenseBackend::new(TypesenseBackendArgs {
      base_url: "https://users.example:8108//".to_string(),
      api_key: String::new(),
      request_timeout: Duration::from_secs(1),
      connect_timeout: Duration::from_secs(1),
    })
    .unwrap();
    assert_eq!(ts.base_url(), "https://users.example:8108");
    assert_eq!(
      ts.document_url("users", "u1"),
      "https://users.example:8108/collections/users/documents/u1"
    );
  }
}
