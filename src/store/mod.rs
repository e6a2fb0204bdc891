//! File queue and result store.
//!
//! The queue tracks every ingested file from arrival to completion or
//! permanent failure. The result store holds classified records, per-type
//! counters and the duplicate ledger. Both are traits so nodes can share a
//! backing store; [`MemoryStore`] implements both.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::dedup::{AppliedDelta, DedupOutcome, DtCandidate, DuplicateGroup, DuplicateKey};
use crate::error::StoreError;
use crate::record::{ClassifiedRecord, RecordCounts};

pub type FileQueueRef = Arc<dyn FileQueue>;
pub type ResultStoreRef = Arc<dyn ResultStore>;

/// Lifecycle of a queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Completed,
    /// Exhausted its attempts.
    Failed,
}

/// A file handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub file_id: String,
    pub business_day: NaiveDate,
    /// Path relative to the source storage.
    pub location: String,
    pub raw_line_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedFile {
    pub file_id: String,
    pub business_day: NaiveDate,
    pub location: String,
    /// Ingestion order, assigned at enqueue.
    pub sequence: u64,
    pub raw_line_count: Option<u64>,
    pub attempts: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// What happens to a file after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still queued; retried on a later tick.
    Retry { attempts: u32 },
    /// Attempts exhausted.
    Permanent { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    /// Files not completed whose last attempt failed.
    pub files_with_errors: usize,
    /// Raw lines in queued files, where known.
    pub pending_raw_lines: u64,
}

#[async_trait]
pub trait FileQueue: Send + Sync {
    /// Add a file. Returns `None` when the file id is already known.
    async fn enqueue(&self, file: NewFile) -> Result<Option<QueuedFile>, StoreError>;

    /// Files still waiting, in ingestion order.
    async fn queued(&self) -> Result<Vec<QueuedFile>, StoreError>;

    async fn get(&self, file_id: &str) -> Result<Option<QueuedFile>, StoreError>;

    async fn mark_completed(&self, file_id: &str) -> Result<(), StoreError>;

    /// Count a failed attempt; after `max_attempts` the file is failed for good.
    async fn record_failure(
        &self,
        file_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<FailureOutcome, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// Everything produced for one file.
#[derive(Debug, Clone)]
pub struct FileResult {
    pub file_id: String,
    pub business_day: NaiveDate,
    pub file_sequence: u64,
    pub records: Vec<ClassifiedRecord>,
    /// Keyed DT candidates of this file.
    pub candidates: Vec<DtCandidate>,
    pub dedup: DedupOutcome,
    pub counts: RecordCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// An earlier result for the same file was replaced.
    pub replaced: bool,
    pub applied: AppliedDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub records: RecordCounts,
    pub files_committed: usize,
    pub duplicate_groups: usize,
    pub increments_applied: usize,
    pub skips_applied: usize,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Previously committed candidates sharing a key with `batch`.
    async fn known_candidates(&self, batch: &[DtCandidate])
    -> Result<Vec<DtCandidate>, StoreError>;

    /// Persist a file's results, replacing any earlier result for the same
    /// file, and apply its duplicate decisions to the ledger.
    async fn commit(&self, result: FileResult) -> Result<CommitSummary, StoreError>;

    async fn counters(&self) -> Result<StoreCounters, StoreError>;

    async fn records(&self, file_id: &str) -> Result<Option<Vec<ClassifiedRecord>>, StoreError>;

    async fn duplicate_group(
        &self,
        key: &DuplicateKey,
    ) -> Result<Option<DuplicateGroup>, StoreError>;
}
