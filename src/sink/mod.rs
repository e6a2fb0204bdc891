//! Export of committed file results.
//!
//! For every committed file the sink writes the classified records as NDJSON
//! and a JSON summary next to it:
//!
//! ```text
//! <root>/<business_day>/<file_id>.records.ndjson
//! <root>/<business_day>/<file_id>.summary.json
//! ```
//!
//! Both objects are replaced when a file is reprocessed, so an export always
//! reflects the latest commit.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tracing::debug;

use crate::config::SinkConfig;
use crate::dedup::DuplicateGroup;
use crate::error::{SinkError, SinkSerializeSnafu, SinkStorageSnafu, SinkWriteSnafu};
use crate::record::RecordCounts;
use crate::storage::{StorageProvider, StorageProviderRef};
use crate::store::FileResult;

/// Summary written next to a file's records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary<'a> {
    pub file_id: &'a str,
    pub business_day: NaiveDate,
    pub file_sequence: u64,
    pub counts: &'a RecordCounts,
    pub duplicate_groups: &'a [DuplicateGroup],
    pub exported_at: DateTime<Utc>,
}

pub struct ResultSink {
    storage: StorageProviderRef,
}

impl ResultSink {
    pub async fn from_config(config: &SinkConfig) -> Result<Self, SinkError> {
        let storage =
            StorageProvider::for_url_with_options(&config.path, config.storage_options.clone())
                .await
                .context(SinkStorageSnafu)?;
        Ok(Self::new(std::sync::Arc::new(storage)))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    fn object_path(result: &FileResult, suffix: &str) -> String {
        format!("{}/{}.{}", result.business_day, result.file_id, suffix)
    }

    /// Write the records and summary of `result`.
    pub async fn export(&self, result: &FileResult) -> Result<(), SinkError> {
        let mut ndjson = Vec::new();
        for record in &result.records {
            serde_json::to_writer(&mut ndjson, record).context(SinkSerializeSnafu {
                file_id: result.file_id.clone(),
            })?;
            ndjson.push(b'\n');
        }

        let summary = FileSummary {
            file_id: &result.file_id,
            business_day: result.business_day,
            file_sequence: result.file_sequence,
            counts: &result.counts,
            duplicate_groups: &result.dedup.duplicates,
            exported_at: Utc::now(),
        };
        let summary = serde_json::to_vec_pretty(&summary).context(SinkSerializeSnafu {
            file_id: result.file_id.clone(),
        })?;

        let records_path = Self::object_path(result, "records.ndjson");
        self.storage
            .put(records_path.as_str(), Bytes::from(ndjson))
            .await
            .context(SinkWriteSnafu {
                file_id: result.file_id.clone(),
            })?;

        let summary_path = Self::object_path(result, "summary.json");
        self.storage
            .put(summary_path.as_str(), Bytes::from(summary))
            .await
            .context(SinkWriteSnafu {
                file_id: result.file_id.clone(),
            })?;

        debug!(
            file_id = %result.file_id,
            records = result.records.len(),
            "Exported results to {}",
            records_path
        );
        Ok(())
    }
}
