//! In-process store shared by every node holding the same `Arc`.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::dedup::{DtCandidate, DuplicateGroup, DuplicateKey, DuplicateLedger};
use crate::error::{StoreError, UnknownFileSnafu};
use crate::record::{ClassifiedRecord, RecordCounts};

use super::{
    CommitSummary, FailureOutcome, FileQueue, FileResult, NewFile, QueueStats, QueueStatus,
    QueuedFile, ResultStore, StoreCounters,
};

#[derive(Default)]
struct Inner {
    queue: IndexMap<String, QueuedFile>,
    next_sequence: u64,
    results: HashMap<String, FileResult>,
    counts: RecordCounts,
    ledger: DuplicateLedger,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileQueue for MemoryStore {
    async fn enqueue(&self, file: NewFile) -> Result<Option<QueuedFile>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.queue.contains_key(&file.file_id) {
            return Ok(None);
        }

        inner.next_sequence += 1;
        let queued = QueuedFile {
            file_id: file.file_id.clone(),
            business_day: file.business_day,
            location: file.location,
            sequence: inner.next_sequence,
            raw_line_count: file.raw_line_count,
            attempts: 0,
            status: QueueStatus::Queued,
            last_error: None,
            enqueued_at: Utc::now(),
        };
        debug!(file_id = %queued.file_id, sequence = queued.sequence, "Enqueued file");
        inner.queue.insert(file.file_id, queued.clone());
        Ok(Some(queued))
    }

    async fn queued(&self) -> Result<Vec<QueuedFile>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .values()
            .filter(|f| f.status == QueueStatus::Queued)
            .cloned()
            .collect())
    }

    async fn get(&self, file_id: &str) -> Result<Option<QueuedFile>, StoreError> {
        Ok(self.inner.lock().await.queue.get(file_id).cloned())
    }

    async fn mark_completed(&self, file_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let file = inner
            .queue
            .get_mut(file_id)
            .ok_or_else(|| UnknownFileSnafu { file_id }.build())?;
        file.status = QueueStatus::Completed;
        file.last_error = None;
        Ok(())
    }

    async fn record_failure(
        &self,
        file_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<FailureOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let file = inner
            .queue
            .get_mut(file_id)
            .ok_or_else(|| UnknownFileSnafu { file_id }.build())?;

        file.attempts += 1;
        file.last_error = Some(error.to_string());
        if file.attempts >= max_attempts {
            file.status = QueueStatus::Failed;
            Ok(FailureOutcome::Permanent {
                attempts: file.attempts,
            })
        } else {
            Ok(FailureOutcome::Retry {
                attempts: file.attempts,
            })
        }
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for file in inner.queue.values() {
            match file.status {
                QueueStatus::Queued => {
                    stats.queued_files += 1;
                    stats.pending_raw_lines += file.raw_line_count.unwrap_or(0);
                    if file.last_error.is_some() {
                        stats.files_with_errors += 1;
                    }
                }
                QueueStatus::Completed => stats.completed_files += 1,
                QueueStatus::Failed => {
                    stats.failed_files += 1;
                    stats.files_with_errors += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn known_candidates(
        &self,
        batch: &[DtCandidate],
    ) -> Result<Vec<DtCandidate>, StoreError> {
        Ok(self.inner.lock().await.ledger.known_for(batch))
    }

    async fn commit(&self, result: FileResult) -> Result<CommitSummary, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut summary = CommitSummary::default();

        if let Some(previous) = inner.results.get(&result.file_id) {
            inner.counts.subtract(&previous.counts);
            summary.replaced = true;
        }
        inner.counts.merge(&result.counts);

        inner.ledger.register(&result.candidates);
        for group in &result.dedup.duplicates {
            let delta = inner.ledger.apply(group);
            summary.applied.increments += delta.increments;
            summary.applied.skips += delta.skips;
        }

        inner.results.insert(result.file_id.clone(), result);
        Ok(summary)
    }

    async fn counters(&self) -> Result<StoreCounters, StoreError> {
        let inner = self.inner.lock().await;
        Ok(StoreCounters {
            records: inner.counts.clone(),
            files_committed: inner.results.len(),
            duplicate_groups: inner.ledger.group_count(),
            increments_applied: inner.ledger.increments_total(),
            skips_applied: inner.ledger.skips_total(),
        })
    }

    async fn records(&self, file_id: &str) -> Result<Option<Vec<ClassifiedRecord>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .results
            .get(file_id)
            .map(|r| r.records.clone()))
    }

    async fn duplicate_group(
        &self,
        key: &DuplicateKey,
    ) -> Result<Option<DuplicateGroup>, StoreError> {
        Ok(self.inner.lock().await.ledger.group(key).cloned())
    }
}
