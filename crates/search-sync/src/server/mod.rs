use std::sync::Arc;

use exobook_config::{config, configure_sentry, ClientInitGuard, ConfigError, Settings};
use exobook_result::errors::{BoxedErr, ErrorType, SimpleError};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use crate::{
  bus::kafka::KafkaBus,
  controller::{shutdown::shutdown_listener, SearchSyncController, SearchSyncControllerArgs},
  index::typesense::{TypesenseBackend, TypesenseBackendArgs},
  server::observability::MetricsCollector,
};

pub mod observability;

pub struct SearchSyncServer {
  pub(super) config: Arc<Settings>,
  pub(super) metrics: Arc<MetricsCollector>,
  pub(super) bus: Arc<KafkaBus>,
  pub(super) users_backend: Arc<TypesenseBackend>,
  pub(super) posts_backend: Arc<TypesenseBackend>,
  _sentry: Option<ClientInitGuard>,
}

impl SearchSyncServer {
  /// Load settings and open every connection. Any error here aborts startup.
  pub async fn new() -> Result<SearchSyncServer, BoxedErr> {
    let se = |err: BoxedErr, typ: ErrorType, msg: &str| {
      return SimpleError { err, err_type: typ, message: msg.to_string() };
    };

    SearchSyncServer::setup_logging();
    let config = config()
      .await
      .map_err(|err| se(Box::new(err), ErrorType::ConfigError, "failed to load settings"))?;

    config.validate().map_err(|err| {
      let typ = match err {
        ConfigError::MissingCredentials(_) | ConfigError::InvalidCredentials { .. } => {
          ErrorType::InvalidCredentials
        }
        _ => ErrorType::ConfigError,
      };
      se(Box::new(err), typ, "invalid settings")
    })?;

    let sentry = configure_sentry!(config, search_sync);

    // Initialize observability
    let metrics = MetricsCollector::new()?;

    let bus = KafkaBus::connect(&config.bus).await.map_err(|err| {
      se(Box::new(err), ErrorType::BrokerConnection, "failed to connect to the bus")
    })?;

    let backend = |base_url: &str| {
      TypesenseBackend::new(TypesenseBackendArgs {
        base_url: base_url.to_string(),
        api_key: config.search.api_key.clone(),
        request_timeout: config.search.request_timeout(),
        connect_timeout: config.search.connect_timeout(),
      })
    };
    let users_backend = backend(&config.search.users_url)?;
    let posts_backend = backend(&config.search.posts_url)?;
    info!(
      "Search backends ready: users at {}, posts at {}",
      users_backend.base_url(),
      posts_backend.base_url()
    );

    let server = SearchSyncServer {
      config: Arc::new(config),
      metrics: Arc::new(metrics),
      bus: Arc::new(bus),
      users_backend: Arc::new(users_backend),
      posts_backend: Arc::new(posts_backend),
      _sentry: sentry,
    };

    Ok(server)
  }

  /// Run until a shutdown signal arrives and the in-flight work is drained
  pub async fn run(&self) -> Result<(), BoxedErr> {
    let shutdown = CancellationToken::new();
    shutdown_listener(shutdown.clone());

    let metrics_clone = self.metrics.clone();
    let metrics_addr = self.config.hosts.search_metrics.clone();
    let metrics_shutdown = shutdown.clone();
    spawn(async move {
      if let Err(e) = metrics_clone.run(&metrics_addr, metrics_shutdown).await {
        error!("Metrics server failed: {:?}", e);
      }
    });

    self.bus.periodic_commit(self.config.bus.commit_interval(), shutdown.clone());

    let controller = SearchSyncController::new(SearchSyncControllerArgs {
      config: self.config.clone(),
      bus: self.bus.clone(),
      users_backend: self.users_backend.clone(),
      posts_backend: self.posts_backend.clone(),
      metrics: self.metrics.clone(),
    });

    let result = controller.run(shutdown.clone()).await; // this will block
    shutdown.cancel();
    result
  }

  fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber =
      tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer());
    if tracing::subscriber::set_global_default(subscriber).is_err() {
      warn!("A tracing subscriber is already installed");
    }
  }
}
