//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::record::RecordType;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted after a file's lines have been classified.
pub struct RecordsClassified {
    pub record_type: RecordType,
    pub count: u64,
}

impl InternalEvent for RecordsClassified {
    fn emit(self) {
        trace!(
            record_type = self.record_type.as_str(),
            count = self.count,
            "Records classified"
        );
        counter!("tddf_records_classified_total", "type" => self.record_type.as_str())
            .increment(self.count);
    }
}

/// Event emitted when compressed bytes are read from source.
pub struct BytesRead {
    pub bytes: u64,
}

impl InternalEvent for BytesRead {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes read");
        counter!("tddf_bytes_read_total").increment(self.bytes);
    }
}

/// Outcome of one file attempt.
#[derive(Debug, Clone, Copy)]
pub enum FileStatus {
    Success,
    /// Another node holds the claim.
    Yielded,
    /// Already processed by another node.
    Skipped,
    Failed,
    PermanentlyFailed,
}

impl FileStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Success => "success",
            FileStatus::Yielded => "yielded",
            FileStatus::Skipped => "skipped",
            FileStatus::Failed => "failed",
            FileStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

/// Event emitted when a queued file has been attempted.
pub struct FileProcessed {
    pub status: FileStatus,
}

impl InternalEvent for FileProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "File processed");
        counter!("tddf_files_processed_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Stage at which a file failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Decompress,
    Classify,
    Persist,
    Export,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Decompress => "decompress",
            FailureStage::Classify => "classify",
            FailureStage::Persist => "persist",
            FailureStage::Export => "export",
        }
    }
}

/// Event emitted when a file fails processing.
pub struct FileFailed {
    pub stage: FailureStage,
}

impl InternalEvent for FileFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "File failed");
        counter!("tddf_files_failed_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Event emitted when a file has been fully processed.
pub struct FileProcessingCompleted {
    pub duration: Duration,
}

impl InternalEvent for FileProcessingCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "File processing completed"
        );
        histogram!("tddf_file_processing_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy)]
pub enum ClaimOutcome {
    Granted,
    Denied,
    Contention,
    /// The file was already processed.
    Completed,
}

impl ClaimOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Granted => "granted",
            ClaimOutcome::Denied => "denied",
            ClaimOutcome::Contention => "contention",
            ClaimOutcome::Completed => "completed",
        }
    }
}

/// Event emitted on every claim attempt.
pub struct ClaimAttempted {
    pub outcome: ClaimOutcome,
}

impl InternalEvent for ClaimAttempted {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Claim attempted");
        counter!("tddf_claim_attempts_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Event emitted when a heartbeat could not extend a claim.
pub struct HeartbeatFailed;

impl InternalEvent for HeartbeatFailed {
    fn emit(self) {
        trace!("Heartbeat failed");
        counter!("tddf_claim_heartbeat_failures_total").increment(1);
    }
}

/// Event emitted when expired claims are demoted to stale.
pub struct StaleClaimsSwept {
    pub count: usize,
}

impl InternalEvent for StaleClaimsSwept {
    fn emit(self) {
        trace!(count = self.count, "Stale claims swept");
        counter!("tddf_stale_claims_swept_total").increment(self.count as u64);
    }
}

/// Event emitted when duplicate decisions are newly applied.
pub struct DuplicatesResolved {
    pub increments: usize,
    pub skips: usize,
}

impl InternalEvent for DuplicatesResolved {
    fn emit(self) {
        trace!(
            increments = self.increments,
            skips = self.skips,
            "Duplicates resolved"
        );
        counter!("tddf_duplicates_resolved_total", "strategy" => "increment")
            .increment(self.increments as u64);
        counter!("tddf_duplicates_resolved_total", "strategy" => "skip")
            .increment(self.skips as u64);
    }
}

/// Gauge for files waiting in the queue.
pub struct QueueDepth {
    pub files: usize,
    pub raw_lines: u64,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        gauge!("tddf_queued_files").set(self.files as f64);
        gauge!("tddf_pending_raw_lines").set(self.raw_lines as f64);
    }
}

/// Gauge for the scheduler state machine.
pub struct SchedulerStateChanged {
    pub running: bool,
    pub paused: bool,
}

impl InternalEvent for SchedulerStateChanged {
    fn emit(self) {
        trace!(
            running = self.running,
            paused = self.paused,
            "Scheduler state changed"
        );
        gauge!("tddf_scheduler_running").set(if self.running { 1.0 } else { 0.0 });
        gauge!("tddf_scheduler_paused").set(if self.paused { 1.0 } else { 0.0 });
    }
}

/// Gauges for the rolling throughput figures.
pub struct ThroughputSampled {
    pub records_per_minute: f64,
    pub peak_records_per_minute: f64,
}

impl InternalEvent for ThroughputSampled {
    fn emit(self) {
        gauge!("tddf_records_per_minute").set(self.records_per_minute);
        gauge!("tddf_peak_records_per_minute").set(self.peak_records_per_minute);
    }
}

/// Storage operation type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
        }
    }
}

/// Request status for storage operations.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted on each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "tddf_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the duration of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "tddf_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
