use std::{
  future::{pending, Future},
  io,
};

use tokio::{select, signal::ctrl_c, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `shutdown` on Ctrl+C or, on unix, SIGTERM
pub fn shutdown_listener(shutdown: CancellationToken) {
  spawn(wait_for_signal(shutdown, ctrl_c(), terminate()));
}

async fn wait_for_signal(
  shutdown: CancellationToken,
  interrupt: impl Future<Output = io::Result<()>>,
  terminate: impl Future<Output = ()>,
) {
  let interrupt = async {
    match interrupt.await {
      Ok(()) => info!("Shutdown signal received (Ctrl+C). Initiating graceful drain..."),
      Err(err) => {
        // SIGTERM still works without a Ctrl+C handler
        error!("Error waiting for ctrl_c: {}", err);
        pending::<()>().await;
      }
    }
  };

  select! {
    _ = interrupt => {}
    _ = terminate => {
      info!("Shutdown signal received (SIGTERM). Initiating graceful drain...");
    }
    _ = shutdown.cancelled() => return,
  }

  shutdown.cancel();
}

#[cfg(unix)]
async fn terminate() {
  use tokio::signal::unix::{signal, SignalKind};

  match signal(SignalKind::terminate()) {
    Ok(mut sigterm) => {
      sigterm.recv().await;
    }
    Err(err) => {
      error!("Could not install SIGTERM handler: {}", err);
      pending::<()>().await;
    }
  }
}

#[cfg(not(unix))]
async fn terminate() {
  pending::<()>().await;
}
