use std::{convert::Infallible, sync::Arc};

use exobook_result::errors::{BoxedErr, ErrorType, InternalError};
use http_body_util::Full;
use hyper::{
  body::{Bytes, Incoming},
  header::{HeaderValue, CONTENT_TYPE},
  server::conn::http1::Builder,
  service::service_fn,
  Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use opentelemetry::{
  metrics::{Counter, Histogram, MeterProvider as _},
  KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Registry, TextEncoder};
use tokio::{net::TcpListener, select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// OpenTelemetry + Prometheus metrics collector for the search sync service
pub struct MetricsCollector {
  registry: Arc<Registry>,
  _provider: Arc<SdkMeterProvider>,
  messages_processed: Counter<u64>,
  messages_failed: Counter<u64>,
  index_duration: Histogram<f64>,
  index_retries: Counter<u64>,
}

impl std::fmt::Debug for MetricsCollector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MetricsCollector").finish()
  }
}

/// Stage of the pipeline at which a message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
  Decode,
  Apply,
}

impl FailureStage {
  pub fn as_str(&self) -> &'static str {
    match self {
      FailureStage::Decode => "decode",
      FailureStage::Apply => "apply",
    }
  }
}

impl MetricsCollector {
  pub fn new() -> Result<Self, BoxedErr> {
    let ie = |msg: &str, err: BoxedErr| {
      let path = "search-sync.server.observability".into();
      InternalError { err_type: ErrorType::InternalError, temp: false, err, msg: msg.into(), path }
    };

    let registry = Registry::new();

    let exporter = opentelemetry_prometheus::exporter()
      .with_registry(registry.clone())
      .build()
      .map_err(|err| ie("failed to initialize prometheus exporter", Box::new(err)))?;

    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    let meter = provider.meter("search-sync");

    let messages_processed = meter
      .u64_counter("search_sync_messages_processed")
      .with_description("Messages applied to the search index")
      .build();
    let messages_failed = meter
      .u64_counter("search_sync_messages_failed")
      .with_description("Messages dropped after a decode or apply failure")
      .build();
    let index_duration = meter
      .f64_histogram("search_sync_index_duration_seconds")
      .with_description("Duration of a single search index call")
      .with_unit("s")
      .build();
    let index_retries = meter
      .u64_counter("search_sync_index_retries")
      .with_description("Search index calls retried after a transient failure")
      .build();

    Ok(MetricsCollector {
      registry: Arc::new(registry),
      _provider: Arc::new(provider),
      messages_processed,
      messages_failed,
      index_duration,
      index_retries,
    })
  }

  pub fn record_message_processed(&self, subject: &str) {
    self.messages_processed.add(1, &[KeyValue::new("subject", subject.to_string())]);
  }

  pub fn record_message_failed(&self, subject: &str, stage: FailureStage) {
    let attrs =
      [KeyValue::new("subject", subject.to_string()), KeyValue::new("stage", stage.as_str())];
    self.messages_failed.add(1, &attrs);
  }

  pub fn observe_index_duration(&self, collection: &str, operation: &'static str, secs: f64) {
    let attrs =
      [KeyValue::new("collection", collection.to_string()), KeyValue::new("operation", operation)];
    self.index_duration.record(secs, &attrs);
  }

  pub fn record_index_retry(&self, collection: &str) {
    self.index_retries.add(1, &[KeyValue::new("collection", collection.to_string())]);
  }

  /// Prometheus text exposition of everything recorded so far
  pub fn render(&self) -> String {
    render(&self.registry)
  }

  /// Serve `/metrics` and `/health` on `addr` until `shutdown` fires
  pub async fn run(&self, addr: &str, shutdown: CancellationToken) -> Result<(), BoxedErr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Search sync metrics server listening on {}", local);

    loop {
      let (socket, _) = select! {
        _ = shutdown.cancelled() => {
          info!("Metrics server shutting down");
          return Ok(());
        }
        accepted = listener.accept() => accepted?,
      };
      let io = TokioIo::new(socket);

      let connection_registry = self.registry.clone();

      spawn(async move {
        let svc = service_fn(move |req: Request<Incoming>| {
          let request_registry = connection_registry.clone();

          async move {
            let response = match req.uri().path() {
              "/metrics" => {
                let mut resp = Response::new(Full::new(Bytes::from(render(&request_registry))));
                resp.headers_mut().insert(
                  CONTENT_TYPE,
                  HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
              }
              "/health" => Response::new(Full::new(Bytes::from_static(b"OK"))),
              _ => {
                let mut resp = Response::new(Full::new(Bytes::from_static(b"Not Found")));
                *resp.status_mut() = StatusCode::NOT_FOUND;
                resp
              }
            };
            Ok::<_, Infallible>(response)
          }
        });

        if let Err(err) = Builder::new().serve_connection(io, svc).await {
          error!("Error serving metrics: {}", err);
        }
      });
    }
  }
}

fn render(registry: &Registry) -> String {
  TextEncoder::new().encode_to_string(&registry.gather()).unwrap_or_else(|err| {
    error!("Failed to encode metrics: {}", err);
    String::new()
  })
}
