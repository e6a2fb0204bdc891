//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// If the Unix handlers cannot be installed this falls back to Ctrl-C.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (|| {
        Ok::<_, std::io::Error>((
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::quit())?,
        ))
    })();

    let (mut sigint, mut sigterm, mut sigquit) = match handlers {
        Ok(handlers) => handlers,
        Err(e) => {
            error!("Failed to set up signal handlers, falling back to Ctrl-C: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "Ctrl-C"),
        Err(e) => {
            // Without any handler the process can only be stopped externally.
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Cancel `shutdown` on the first signal.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down, finishing the current file");
        shutdown.cancel();
    });
}
