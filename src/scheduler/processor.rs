//! Processing of one claimed file.
//!
//! fetch -> decode + classify (blocking pool) -> dedup against the ledger
//! -> export -> commit. Every step is idempotent under full reprocessing:
//! record ids are derived from file and line, commits replace the file's
//! earlier result and the ledger only applies new decisions.

use serde::Serialize;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::dedup::{AppliedDelta, DedupEngine, DtCandidate};
use crate::emit;
use crate::error::{
    ClassifyTaskSnafu, DecodeFileSnafu, ExportResultsSnafu, FetchFileSnafu, FileError,
    PersistResultsSnafu, ReaderError,
};
use crate::metrics::events::{DuplicatesResolved, RecordsClassified};
use crate::record::{ClassifiedRecord, RecordCounts, RecordType, classify_all};
use crate::sink::ResultSink;
use crate::source::LineReader;
use crate::storage::StorageProviderRef;
use crate::store::{FileResult, QueuedFile, ResultStoreRef};

/// Lowest and highest DT trace number of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRange {
    pub start: String,
    pub end: String,
}

impl TransactionRange {
    pub fn of(records: &[ClassifiedRecord]) -> Option<Self> {
        let mut traces = records
            .iter()
            .filter(|r| r.record_type == RecordType::DT)
            .filter_map(|r| r.trace_number.as_deref());
        let first = traces.next()?;
        let (start, end) = traces.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        Some(Self {
            start: start.to_string(),
            end: end.to_string(),
        })
    }
}

/// What processing one file produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedFile {
    pub counts: RecordCounts,
    pub transaction_range: Option<TransactionRange>,
    pub duplicate_groups: usize,
    pub applied: AppliedDelta,
    pub replaced: bool,
}

pub struct FileProcessor {
    storage: StorageProviderRef,
    reader: LineReader,
    results: ResultStoreRef,
    dedup: DedupEngine,
    sink: Option<Arc<ResultSink>>,
}

impl FileProcessor {
    pub fn new(
        storage: StorageProviderRef,
        reader: LineReader,
        results: ResultStoreRef,
        dedup: DedupEngine,
    ) -> Self {
        Self {
            storage,
            reader,
            results,
            dedup,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn process(&self, file: &QueuedFile) -> Result<ProcessedFile, FileError> {
        let bytes = self
            .storage
            .get(file.location.as_str())
            .await
            .context(FetchFileSnafu {
                location: file.location.clone(),
            })?;

        let reader = self.reader;
        let file_id = file.file_id.clone();
        let business_day = file.business_day;
        let records = tokio::task::spawn_blocking(move || {
            let lines = reader.read(&bytes, &file_id, business_day)?;
            Ok::<_, ReaderError>(classify_all(&lines))
        })
        .await
        .context(ClassifyTaskSnafu)?
        .context(DecodeFileSnafu)?;

        let counts = RecordCounts::tally(&records);
        for (record_type, count) in &counts.processed {
            emit!(RecordsClassified {
                record_type: *record_type,
                count: *count,
            });
        }
        if counts.total_skipped() > 0 {
            emit!(RecordsClassified {
                record_type: RecordType::Skipped,
                count: counts.total_skipped(),
            });
        }

        let candidates: Vec<DtCandidate> = records
            .iter()
            .filter_map(|r| DtCandidate::from_record(r, file.sequence))
            .collect();
        let known = self
            .results
            .known_candidates(&candidates)
            .await
            .context(PersistResultsSnafu)?;
        let dedup = self.dedup.resolve(&candidates, &known);
        let duplicate_groups = dedup.duplicates.len();
        let transaction_range = TransactionRange::of(&records);

        let result = FileResult {
            file_id: file.file_id.clone(),
            business_day: file.business_day,
            file_sequence: file.sequence,
            records,
            candidates,
            dedup,
            counts: counts.clone(),
        };

        // A committed file always has an up-to-date export.
        if let Some(sink) = &self.sink {
            sink.export(&result).await.context(ExportResultsSnafu)?;
        }

        let summary = self
            .results
            .commit(result)
            .await
            .context(PersistResultsSnafu)?;

        if !summary.applied.is_empty() {
            emit!(DuplicatesResolved {
                increments: summary.applied.increments,
                skips: summary.applied.skips,
            });
        }
        if summary.replaced {
            debug!(file_id = %file.file_id, "Replaced earlier result");
        }

        info!(
            file_id = %file.file_id,
            lines = counts.total_lines,
            dt = counts.processed_of(RecordType::DT),
            skipped = counts.total_skipped(),
            duplicate_groups,
            "Processed file"
        );

        Ok(ProcessedFile {
            counts,
            transaction_range,
            duplicate_groups,
            applied: summary.applied,
            replaced: summary.replaced,
        })
    }
}
