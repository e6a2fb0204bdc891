//! Prometheus metrics and the HTTP listener.
//!
//! The listener serves `/metrics`, `/health` and whatever API routes the
//! caller merges in.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve it together with `api`.
///
/// The server stops when `shutdown` is cancelled.
pub fn init(
    addr: SocketAddr,
    api: Router,
    shutdown: CancellationToken,
) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(run_server(addr, router(handle).merge(api), shutdown));

    Ok(())
}

/// Serve `api` and `/health` without installing a recorder.
pub fn serve(addr: SocketAddr, api: Router, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(api);
    tokio::spawn(run_server(addr, app, shutdown));
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn run_server(addr: SocketAddr, app: Router, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind HTTP server to {}: {}", addr, e);
            return;
        }
    };
    info!("HTTP server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!("HTTP server error: {}", e);
    }
}

/// Handler for `/metrics` endpoint.
async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

/// Handler for `/health` endpoint.
async fn health_handler() -> &'static str {
    "ok\n"
}
