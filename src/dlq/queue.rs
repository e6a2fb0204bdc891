//! Dead Letter Queue implementation.
//!
//! Each run writes one `failures-<timestamp>.ndjson` object. Storage `put`
//! replaces objects, so every flush rewrites the run's full log.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::metrics::events::FailureStage;
use crate::storage::StorageProvider;

use super::types::{FailedFile, FailureStats};

pub struct DeadLetterQueue {
    storage: Arc<StorageProvider>,
    filename: String,
    entries: Mutex<Vec<FailedFile>>,
    stats: Mutex<FailureStats>,
}

impl DeadLetterQueue {
    /// Create a DLQ from configuration, or `None` if no path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("failures-{}.ndjson", timestamp);

        info!("DLQ enabled: {}/{}", dlq_path, filename);

        Ok(Some(Self {
            storage: Arc::new(storage),
            filename,
            entries: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
        }))
    }

    /// Record a permanently failed file and write the log out.
    pub async fn record_failure(
        &self,
        file_id: &str,
        location: &str,
        error: &str,
        stage: FailureStage,
        attempts: u32,
    ) -> Result<(), DlqError> {
        debug!(file_id, stage = stage.as_str(), "Recording DLQ failure");

        self.stats.lock().await.increment(stage);
        self.entries.lock().await.push(FailedFile {
            file_id: file_id.to_string(),
            location: location.to_string(),
            error: error.to_string(),
            stage,
            timestamp: Utc::now(),
            attempts,
        });

        self.flush().await
    }

    /// Write every record of this run to storage.
    pub async fn flush(&self) -> Result<(), DlqError> {
        let ndjson = {
            let entries = self.entries.lock().await;
            if entries.is_empty() {
                return Ok(());
            }
            let mut ndjson = String::new();
            for record in entries.iter() {
                let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
                ndjson.push_str(&line);
                ndjson.push('\n');
            }
            ndjson
        };

        self.storage
            .put(self.filename.as_str(), Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;
        Ok(())
    }

    pub async fn stats(&self) -> FailureStats {
        *self.stats.lock().await
    }

    pub async fn finalize(&self) -> Result<(), DlqError> {
        self.flush().await?;
        let stats = self.stats().await;
        if stats.total() > 0 {
            warn!(
                "DLQ finalized: {} permanently failed files (fetch={}, decompress={}, classify={}, persist={}, export={})",
                stats.total(),
                stats.fetch,
                stats.decompress,
                stats.classify,
                stats.persist,
                stats.export
            );
        }
        Ok(())
    }
}
