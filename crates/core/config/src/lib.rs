use std::{env, fs, path::Path, time::Duration};

use cached::proc_macro::cached;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const ENV_BUS_CREDENTIALS: &str = "KAFKA_CREDS";
pub const ENV_BUS_BROKERS: &str = "KAFKA_BROKERS";
pub const ENV_SEARCH_API_KEY: &str = "TYPESENSE_API_KEY";
pub const ENV_SEARCH_USERS_URL: &str = "TYPESENSE_USERS_URL";
pub const ENV_SEARCH_POSTS_URL: &str = "TYPESENSE_POSTS_URL";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {reason}")]
  Read { path: String, reason: String },
  #[error("failed to parse config file {path}: {reason}")]
  Parse { path: String, reason: String },
  #[error("{0} is not set, bus credentials are required")]
  MissingCredentials(&'static str),
  #[error("invalid bus credentials at line {line}: expected key=value")]
  InvalidCredentials { line: usize },
  #[error("setting {0} must not be empty")]
  Empty(&'static str),
  #[error("setting {0} must be greater than zero")]
  Zero(&'static str),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BusSubjects {
  pub user_created: String,
  pub user_updated: String,
  pub user_deleted: String,
  pub post_upsert: String,
  pub post_deleted: String,
}

impl Default for BusSubjects {
  fn default() -> Self {
    Self {
      user_created: "users.created".to_string(),
      user_updated: "users.updated".to_string(),
      user_deleted: "users.deleted".to_string(),
      post_upsert: "posts.upsert".to_string(),
      post_deleted: "posts.deleted".to_string(),
    }
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Bus {
  pub brokers: Vec<String>,
  pub group_id: String,
  /// librdkafka client properties, one `key=value` per line
  pub credentials: String,
  pub connect_timeout_ms: u64,
  pub commit_interval_ms: u64,
  pub subjects: BusSubjects,
}

impl Default for Bus {
  fn default() -> Self {
    Self {
      brokers: vec!["localhost:9092".to_string()],
      group_id: "search-sync".to_string(),
      credentials: String::new(),
      connect_timeout_ms: 10_000,
      commit_interval_ms: 1_000,
      subjects: BusSubjects::default(),
    }
  }
}

impl Bus {
  /// Parse the credential blob into client properties.
  ///
  /// Blank lines and lines starting with `#` are skipped.
  pub fn client_properties(&self) -> Result<Vec<(String, String)>, ConfigError> {
    let mut props = Vec::new();
    for (idx, raw) in self.credentials.lines().enumerate() {
      let line = raw.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }

      let (key, value) =
        line.split_once('=').ok_or(ConfigError::InvalidCredentials { line: idx + 1 })?;
      let key = key.trim();
      if key.is_empty() {
        return Err(ConfigError::InvalidCredentials { line: idx + 1 });
      }
      props.push((key.to_string(), value.trim().to_string()));
    }
    Ok(props)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn commit_interval(&self) -> Duration {
    Duration::from_millis(self.commit_interval_ms)
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Search {
  pub api_key: String,
  pub users_url: String,
  pub posts_url: String,
  pub users_collection: String,
  pub posts_collection: String,
  pub request_timeout_ms: u64,
  pub connect_timeout_ms: u64,
}

impl Default for Search {
  fn default() -> Self {
    Self {
      api_key: String::new(),
      users_url: "http://localhost:8108".to_string(),
      posts_url: "http://localhost:8108".to_string(),
      users_collection: "users".to_string(),
      posts_collection: "posts".to_string(),
      request_timeout_ms: 10_000,
      connect_timeout_ms: 3_000,
    }
  }
}

impl Search {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Retry {
  pub max_attempts: u32,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for Retry {
  fn default() -> Self {
    Self { max_attempts: 3, base_backoff_ms: 100, max_backoff_ms: 5_000 }
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Worker {
  pub max_in_flight: usize,
  pub shutdown_grace_secs: u64,
  pub retry: Retry,
}

impl Default for Worker {
  fn default() -> Self {
    Self { max_in_flight: 64, shutdown_grace_secs: 30, retry: Retry::default() }
  }
}

impl Worker {
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Hosts {
  pub search_metrics: String,
}

impl Default for Hosts {
  fn default() -> Self {
    Self { search_metrics: "0.0.0.0:9102".to_string() }
  }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Sentry {
  pub search_sync: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
  pub bus: Bus,
  pub search: Search,
  pub worker: Worker,
  pub hosts: Hosts,
  pub sentry: Sentry,
  pub production: bool,
}

impl Settings {
  /// Apply environment overrides. `lookup` returns the value of a variable, if set.
  pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(creds) = non_empty(ENV_BUS_CREDENTIALS) {
      self.bus.credentials = creds;
    }
    if let Some(brokers) = non_empty(ENV_BUS_BROKERS) {
      self.bus.brokers =
        brokers.split(',').map(|b| b.trim().to_string()).filter(|b| !b.is_empty()).collect();
    }
    if let Some(key) = non_empty(ENV_SEARCH_API_KEY) {
      self.search.api_key = key;
    }
    if let Some(url) = non_empty(ENV_SEARCH_USERS_URL) {
      self.search.users_url = url;
    }
    if let Some(url) = non_empty(ENV_SEARCH_POSTS_URL) {
      self.search.posts_url = url;
    }
  }

  /// Startup checks. Errors here must abort the process.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.bus.credentials.trim().is_empty() {
      return Err(ConfigError::MissingCredentials(ENV_BUS_CREDENTIALS));
    }
    self.bus.client_properties()?;

    if self.bus.brokers.is_empty() {
      return Err(ConfigError::Empty("bus.brokers"));
    }
    if self.bus.group_id.trim().is_empty() {
      return Err(ConfigError::Empty("bus.group_id"));
    }
    if self.search.users_url.trim().is_empty() {
      return Err(ConfigError::Empty("search.users_url"));
    }
    if self.search.posts_url.trim().is_empty() {
      return Err(ConfigError::Empty("search.posts_url"));
    }
    if self.worker.max_in_flight == 0 {
      return Err(ConfigError::Zero("worker.max_in_flight"));
    }
    if self.worker.retry.max_attempts == 0 {
      return Err(ConfigError::Zero("worker.retry.max_attempts"));
    }

    if self.search.api_key.is_empty() {
      warn!("No search API key specified! Requests to the index will be unauthenticated.");
    }

    Ok(())
  }
}

/// Read settings from `/exobook.{ENV}.yaml` (when present) and the environment.
pub fn load() -> Result<Settings, ConfigError> {
  let _ = dotenvy::dotenv();

  let env_mode = env::var("ENV").unwrap_or("dev".to_string());
  let path = format!("/exobook.{}.yaml", env_mode);
  let mut settings = Settings::default();

  if Path::new(&path).exists() {
    let settings_str = fs::read_to_string(&path)
      .map_err(|err| ConfigError::Read { path: path.clone(), reason: err.to_string() })?;
    settings = serde_yaml::from_str(&settings_str)
      .map_err(|err| ConfigError::Parse { path: path.clone(), reason: err.to_string() })?;
  }

  settings.apply_env(|key| env::var(key).ok());

  // auto-detect production nodes
  if settings.search.users_url.starts_with("https") {
    settings.production = true;
  }

  Ok(settings)
}

#[cached(time = 300, result = true)]
pub async fn config() -> Result<Settings, ConfigError> {
  load()
}

#[cfg(feature = "sentry")]
pub use sentry::ClientInitGuard;

/// Configure error reporting for a service
#[cfg(feature = "sentry")]
pub fn setup_sentry(
  release: &'static str,
  dsn: String,
  production: bool,
) -> Option<sentry::ClientInitGuard> {
  if dsn.is_empty() {
    return None;
  }

  let environment = if production { "production" } else { "development" };
  Some(sentry::init((
    dsn,
    sentry::ClientOptions {
      release: Some(release.into()),
      environment: Some(environment.into()),
      ..Default::default()
    },
  )))
}

/// Start Sentry for `$application` with the DSN found under `$config.sentry`.
/// Keep the returned guard alive for as long as events should be reported.
#[cfg(feature = "sentry")]
#[macro_export]
macro_rules! configure_sentry {
  ($config: expr, $application: ident) => {
    $crate::setup_sentry(
      concat!(env!("CARGO_PKG_NAME"), "@", env!("CARGO_PKG_VERSION")),
      $config.sentry.$application.clone(),
      $config.production,
    )
  };
}
