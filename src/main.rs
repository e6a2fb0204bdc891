//! tddf-ingest: TDDF batch processing node.
//!
//! Watches an inbox on local disk or S3, processes each TDDF file exactly
//! once across all nodes sharing a claim store, and serves the operator API
//! and Prometheus metrics.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tddf_ingest::config::Config;
use tddf_ingest::error::{ConfigSnafu, PipelineError};
use tddf_ingest::{run_node, signal};

/// TDDF fixed-width batch processing node.
#[derive(Parser, Debug)]
#[command(name = "tddf-ingest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the node id from the configuration file.
    #[arg(long)]
    node_id: Option<String>,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("tddf-ingest starting");

    let config = build_config(&args)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Node: {}", config.node.id);
        info!("Source: {}", config.source.path);
        info!("Claim backend: {:?}", config.claims.backend);
        info!(
            "Claim TTL: {}s, heartbeat every {}s",
            config.claims.ttl_secs, config.claims.heartbeat_interval_secs
        );
        if let Some(sink) = &config.sink {
            info!("Sink: {}", sink.path);
        }
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    signal::spawn_signal_handler(shutdown.clone());

    let summary = run_node(config, shutdown).await?;

    info!("Node stopped cleanly");
    info!("  Files processed: {}", summary.processed_files);
    info!("  Files dead-lettered: {}", summary.failed_files);

    Ok(())
}

/// Build configuration from arguments.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    let mut config = Config::from_file(&args.config).context(ConfigSnafu)?;
    if let Some(node_id) = &args.node_id {
        config.node.id = node_id.clone();
    }
    config.validate().context(ConfigSnafu)?;
    Ok(config)
}
