use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};

pub type BoxedErr = Box<dyn Error + Sync + Send>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ErrorType {
  // General errors
  InvalidCredentials,

  // External service errors
  InternalError,
  ConfigError,
  HttpRequestError,

  // Broker errors
  BrokerConnection,
  BrokerSubscription,
}

impl fmt::Display for ErrorType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorType::InvalidCredentials => write!(f, "Invalid credentials"),
      ErrorType::InternalError => write!(f, "Internal error"),
      ErrorType::ConfigError => write!(f, "Configuration error"),
      ErrorType::HttpRequestError => write!(f, "HTTP request error"),
      ErrorType::BrokerConnection => write!(f, "Broker connection error"),
      ErrorType::BrokerSubscription => write!(f, "Broker subscription error"),
    }
  }
}

/// Error raised inside a service, tagged with the code path that produced it.
///
/// `temp` marks failures that may succeed when retried.
#[derive(Debug)]
pub struct InternalError {
  pub err_type: ErrorType,
  pub temp: bool,
  pub err: BoxedErr,
  pub msg: String,
  pub path: String,
}

impl InternalError {
  pub fn new(
    path: impl Into<String>,
    err: BoxedErr,
    err_type: ErrorType,
    temp: bool,
    msg: impl Into<String>,
  ) -> Self {
    Self { err_type, temp, err, msg: msg.into(), path: path.into() }
  }
}

impl fmt::Display for InternalError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut parts = Vec::new();

    if !self.path.is_empty() {
      parts.push(format!("path: {}", self.path));
    }
    parts.push(format!("err_type: {}", self.err_type));
    if !self.msg.is_empty() {
      parts.push(format!("msg: {}", self.msg));
    }
    if self.temp {
      parts.push("temp: true".to_string());
    }
    parts.push(format!("err: {}", self.err));

    write!(f, "{}", parts.join(", "))
  }
}

impl Error for InternalError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(self.err.as_ref())
  }
}

#[derive(Debug)]
pub struct SimpleError {
  pub message: String,
  pub err_type: ErrorType,
  pub err: BoxedErr,
}

impl fmt::Display for SimpleError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.message.is_empty() {
      return write!(f, "{}: {}", self.err_type, self.err);
    }
    write!(f, "{}: {}", self.err_type, self.message)
  }
}

impl Error for SimpleError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(self.err.as_ref())
  }
}

#[cfg(test)]
mod tests {
  use std::io::{Error as IoError, ErrorKind};

  use super::*;

  #[test]
  fn internal_error_display_includes_path_and_message() {
    let err = InternalError::new(
      "search-sync.index.create",
      Box::new(IoError::new(ErrorKind::Other, "boom")),
      ErrorType::HttpRequestError,
      true,
      "typesense returned 503",
    );

    let s = err.to_string();
    assert!(s.starts_with("path: search-sync.index.create"));
    assert!(s.contains("err_type: HTTP request error"));
    assert!(s.contains("msg: typesense returned 503"));
    assert!(s.contains("temp: true"));
    assert!(s.ends_with("err: boom"));
  }

  #[test]
  fn simple_error_falls_back_to_source_when_message_is_empty() {
    let err = SimpleError {
      message: String::new(),
      err_type: ErrorType::BrokerConnection,
      err: Box::new(IoError::new(ErrorKind::NotConnected, "broker down")),
    };
    assert_eq!(err.to_string(), "Broker connection error: broker down");
    assert!(err.source().is_some());
  }
}
