//! Wiring for one processing node.
//!
//! Builds the storage, stores, claim coordinator, scheduler, metrics sampler
//! and HTTP listener from a [`Config`] and runs them until shutdown.

use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::claim::{ClaimCoordinator, ClaimStoreRef, DirectoryClaimStore, MemoryClaimStore};
use crate::config::{ClaimBackend, Config};
use crate::dedup::DedupEngine;
use crate::dlq::DeadLetterQueue;
use crate::error::{
    AddressParseSnafu, ClaimSetupSnafu, DlqSnafu, MetricsSnafu, PipelineError,
    PipelineStorageSnafu, SchedulerSnafu, SinkSnafu, TaskJoinSnafu,
};
use crate::metrics::{self, MetricsAggregator, run_sampler};
use crate::scheduler::{FileProcessor, Scheduler};
use crate::sink::ResultSink;
use crate::source::{InboxDiscovery, LineReader};
use crate::status::StatusService;
use crate::storage::StorageProvider;
use crate::store::MemoryStore;

/// Totals reported when a node stops.
#[derive(Debug, Clone, Default)]
pub struct NodeSummary {
    pub processed_files: u64,
    pub failed_files: usize,
}

async fn open_claim_store(backend: &ClaimBackend) -> Result<ClaimStoreRef, PipelineError> {
    Ok(match backend {
        ClaimBackend::Memory => Arc::new(MemoryClaimStore::new()),
        ClaimBackend::Directory { path } => Arc::new(
            DirectoryClaimStore::open(path)
                .await
                .context(ClaimSetupSnafu)?,
        ),
    })
}

/// Run a node until `shutdown` is cancelled.
pub async fn run_node(
    config: Config,
    shutdown: CancellationToken,
) -> Result<NodeSummary, PipelineError> {
    info!(node_id = %config.node.id, source = %config.source.path, "Starting node");

    let storage = Arc::new(
        StorageProvider::for_url_with_options(
            &config.source.path,
            config.source.storage_options.clone(),
        )
        .await
        .context(PipelineStorageSnafu)?,
    );
    let reader = LineReader::new(config.source.compression);
    let store = Arc::new(MemoryStore::new());

    let claims = ClaimCoordinator::new(
        open_claim_store(&config.claims.backend).await?,
        config.node.id.clone(),
        &config.claims,
    );

    let mut processor = FileProcessor::new(
        storage.clone(),
        reader,
        store.clone(),
        DedupEngine::new(config.dedup.max_duplicates_per_group),
    );
    if let Some(sink_config) = &config.sink {
        let sink = ResultSink::from_config(sink_config).await.context(SinkSnafu)?;
        info!("Exporting results to {}", sink_config.path);
        processor = processor.with_sink(Arc::new(sink));
    }

    let dlq = DeadLetterQueue::from_config(&config.error_handling)
        .await
        .context(DlqSnafu)?
        .map(Arc::new);

    let (mut scheduler, handle) = Scheduler::new(
        config.scheduler.clone(),
        store.clone(),
        claims.clone(),
        processor,
        shutdown.clone(),
    );
    if config.scheduler.auto_discover {
        scheduler = scheduler.with_discovery(InboxDiscovery::new(
            storage,
            reader,
            config.source.extensions.clone(),
        ));
    }
    if let Some(dlq) = &dlq {
        scheduler = scheduler.with_dlq(dlq.clone());
    }

    let aggregator = Arc::new(RwLock::new(MetricsAggregator::new(&config.metrics)));
    let sampler = tokio::spawn(run_sampler(
        aggregator.clone(),
        store.clone(),
        store.clone(),
        config.metrics.sample_interval(),
        shutdown.clone(),
    ));

    let status = Arc::new(StatusService::new(
        handle.clone(),
        store.clone(),
        store.clone(),
        claims,
        aggregator,
    ));
    let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
    if config.metrics.enabled {
        metrics::init(addr, api::router(status), shutdown.clone()).context(MetricsSnafu)?;
    } else {
        metrics::serve(addr, api::router(status), shutdown.clone());
    }

    let scheduler_result = tokio::spawn(scheduler.run())
        .await
        .context(TaskJoinSnafu)?;
    // The scheduler only returns on shutdown; make sure the rest follows.
    shutdown.cancel();
    if let Err(e) = sampler.await {
        warn!("Metrics sampler ended abnormally: {}", e);
    }
    scheduler_result.context(SchedulerSnafu)?;

    let mut summary = NodeSummary {
        processed_files: handle.snapshot().processed_file_count,
        ..Default::default()
    };
    if let Some(dlq) = &dlq {
        summary.failed_files = dlq.stats().await.total();
        dlq.finalize().await.context(DlqSnafu)?;
    }

    info!(
        processed_files = summary.processed_files,
        failed_files = summary.failed_files,
        "Node stopped"
    );
    Ok(summary)
}
