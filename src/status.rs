//! Read-only status snapshots for the operator dashboard.
//!
//! Field names are the dashboard's (camelCase). Every snapshot is built even
//! when a backing store is failing: missing pieces fall back to zeros and
//! "no data" instead of failing the call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::claim::{ClaimCoordinator, ClaimStatus};
use crate::metrics::{MetricSample, SharedAggregator};
use crate::record::{RecordCounts, RecordType};
use crate::scheduler::{SchedulerHandle, TransactionRange};
use crate::store::{FileQueueRef, QueueStats, ResultStoreRef};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub queued_files: Vec<String>,
    pub processing_errors: BTreeMap<String, String>,
    pub processed_file_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_transaction_range: Option<TransactionRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TddfOperations {
    pub total_tddf_records: u64,
    pub total_raw_lines: u64,
    pub dt_records_processed: u64,
    pub bh_records_processed: u64,
    pub p1_records_processed: u64,
    pub p2_records_processed: u64,
    pub other_records_processed: u64,
    /// Skipped lines whose identifier named a known non-DT type.
    pub non_dt_records_skipped: u64,
    /// Every other skipped line: malformed DT lines and unreadable ones.
    pub other_skipped: u64,
    pub pending_raw_lines: u64,
}

impl TddfOperations {
    pub fn from_counts(counts: &RecordCounts, pending_raw_lines: u64) -> Self {
        let dt = counts.processed_of(RecordType::DT);
        let bh = counts.processed_of(RecordType::BH);
        let p1 = counts.processed_of(RecordType::P1);
        let p2 = counts.processed_of(RecordType::P2);
        let total_processed = counts.total_processed();
        let non_dt_skipped: u64 = counts
            .skipped
            .iter()
            .filter(|(t, _)| **t != RecordType::DT)
            .map(|(_, n)| n)
            .sum();

        Self {
            total_tddf_records: total_processed,
            total_raw_lines: counts.total_lines,
            dt_records_processed: dt,
            bh_records_processed: bh,
            p1_records_processed: p1,
            p2_records_processed: p2,
            other_records_processed: total_processed - dt - bh - p1 - p2,
            non_dt_records_skipped: non_dt_skipped,
            other_skipped: counts.total_skipped() - non_dt_skipped,
            pending_raw_lines,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub queued_files: usize,
    pub processed_files: usize,
    pub files_with_errors: usize,
    pub transactions_per_second: f64,
    pub tddf_records_per_second: f64,
    pub tddf_operations: TddfOperations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStats {
    /// Active claims per owning node.
    pub processing_by_server: BTreeMap<String, usize>,
    /// Claims that are stale or whose lease has run out.
    pub stale_processing_files: usize,
    pub server_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RawTddfStatus {
    pub processed: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeBreakdown {
    pub processed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceKpis {
    pub has_data: bool,
    pub time_period: String,
    pub tddf_per_minute: f64,
    pub records_per_minute: f64,
    pub color_breakdown: BTreeMap<RecordType, TypeBreakdown>,
}

/// Per-type processed and skipped totals for every type with a schema, plus
/// `OTHER`.
pub fn color_breakdown(counts: &RecordCounts) -> BTreeMap<RecordType, TypeBreakdown> {
    RecordType::KNOWN
        .into_iter()
        .chain([RecordType::Other])
        .map(|t| {
            (
                t,
                TypeBreakdown {
                    processed: counts.processed_of(t),
                    skipped: counts.skipped_of(t),
                },
            )
        })
        .collect()
}

fn describe_window(secs: i64) -> String {
    match secs {
        s if s % 3600 == 0 && s >= 3600 => format!("{} hours", s / 3600),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{s} seconds"),
    }
}

/// Builds the dashboard snapshots for one node.
pub struct StatusService {
    scheduler: SchedulerHandle,
    queue: FileQueueRef,
    results: ResultStoreRef,
    claims: ClaimCoordinator,
    aggregator: SharedAggregator,
}

impl StatusService {
    pub fn new(
        scheduler: SchedulerHandle,
        queue: FileQueueRef,
        results: ResultStoreRef,
        claims: ClaimCoordinator,
        aggregator: SharedAggregator,
    ) -> Self {
        Self {
            scheduler,
            queue,
            results,
            claims,
            aggregator,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await.unwrap_or_else(|e| {
            warn!("Queue stats unavailable: {}", e);
            QueueStats::default()
        })
    }

    async fn record_counts(&self) -> RecordCounts {
        match self.results.counters().await {
            Ok(counters) => counters.records,
            Err(e) => {
                warn!("Result counters unavailable: {}", e);
                RecordCounts::default()
            }
        }
    }

    pub async fn processing_status(&self) -> ProcessingStatus {
        let run = self.scheduler.snapshot();
        let queued_files = match self.queue.queued().await {
            Ok(files) => files.into_iter().map(|f| f.file_id).collect(),
            Err(e) => {
                warn!("Queue unavailable, reporting last known queue: {}", e);
                run.queued_file_ids.clone()
            }
        };

        ProcessingStatus {
            is_running: run.is_running(),
            is_paused: run.is_paused(),
            next_scheduled_run: run.next_scheduled_at,
            last_run_time: run.last_run_at,
            queued_files,
            processing_errors: run.processing_errors,
            processed_file_count: run.processed_file_count,
            current_transaction_range: run.current_transaction_range,
        }
    }

    pub async fn realtime_stats(&self) -> RealtimeStats {
        let stats = self.queue_stats().await;
        let counts = self.record_counts().await;
        let window = self.aggregator.read().await.status(Utc::now());

        RealtimeStats {
            queued_files: stats.queued_files,
            processed_files: stats.completed_files,
            files_with_errors: stats.files_with_errors,
            transactions_per_second: window.transactions_per_second,
            tddf_records_per_second: window.tddf_records_per_second,
            tddf_operations: TddfOperations::from_counts(&counts, stats.pending_raw_lines),
        }
    }

    pub async fn concurrency_stats(&self) -> ConcurrencyStats {
        let now = Utc::now();
        let ttl = self.claims.ttl();
        let claims = self.claims.claims().await.unwrap_or_else(|e| {
            warn!("Claim store unavailable: {}", e);
            Vec::new()
        });

        let mut processing_by_server = BTreeMap::new();
        let mut stale_processing_files = 0;
        for claim in &claims {
            match claim.status {
                ClaimStatus::Active if claim.is_expired(now, ttl) => stale_processing_files += 1,
                ClaimStatus::Active => {
                    *processing_by_server
                        .entry(claim.owner_node_id.clone())
                        .or_default() += 1
                }
                ClaimStatus::Stale => stale_processing_files += 1,
                ClaimStatus::Released | ClaimStatus::Completed => {}
            }
        }

        ConcurrencyStats {
            processing_by_server,
            stale_processing_files,
            server_id: self.claims.node_id().to_string(),
        }
    }

    pub async fn raw_status(&self) -> RawTddfStatus {
        let stats = self.queue_stats().await;
        let counts = self.record_counts().await;
        RawTddfStatus {
            processed: counts.total_lines,
            pending: stats.pending_raw_lines,
        }
    }

    /// Retained samples, oldest first.
    pub async fn performance_history(&self) -> Vec<MetricSample> {
        self.aggregator.read().await.history().cloned().collect()
    }

    pub async fn performance_kpis(&self) -> PerformanceKpis {
        let counts = self.record_counts().await;
        let window = self.aggregator.read().await.status(Utc::now());
        let secs = window
            .window_end
            .signed_duration_since(window.window_start)
            .num_seconds();

        PerformanceKpis {
            has_data: window.has_data,
            time_period: describe_window(secs),
            tddf_per_minute: window.average_tddf_per_minute,
            records_per_minute: window.average_records_per_minute,
            color_breakdown: color_breakdown(&counts),
        }
    }
}
