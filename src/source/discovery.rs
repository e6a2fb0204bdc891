//! Inbox discovery.
//!
//! Lists the source location on every tick and enqueues files the queue has
//! not seen. TDDF file names carry the business day as an 8-digit date
//! (`..._03012024_...`); files without one fall back to their modification
//! date.

use chrono::NaiveDate;
use regex::Regex;
use snafu::prelude::*;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::error::{DiscoverySnafu, QueueStorageSnafu, SchedulerError};
use crate::storage::StorageProviderRef;
use crate::store::{FileQueue, NewFile, QueuedFile};

use super::LineReader;

static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])(?P<date>[0-9]{8})(?:[^0-9]|$)").expect("date token pattern is valid")
});

/// Business day encoded in a file name, `MMDDCCYY` first, then `CCYYMMDD`.
pub fn business_day_from_name(name: &str) -> Option<NaiveDate> {
    DATE_TOKEN
        .captures_iter(name)
        .filter_map(|caps| caps.name("date"))
        .find_map(|m| {
            NaiveDate::parse_from_str(m.as_str(), "%m%d%Y")
                .or_else(|_| NaiveDate::parse_from_str(m.as_str(), "%Y%m%d"))
                .ok()
        })
}

pub struct InboxDiscovery {
    storage: StorageProviderRef,
    reader: LineReader,
    extensions: Vec<String>,
}

impl InboxDiscovery {
    pub fn new(storage: StorageProviderRef, reader: LineReader, extensions: Vec<String>) -> Self {
        Self {
            storage,
            reader,
            extensions,
        }
    }

    fn accepts(&self, path: &str) -> bool {
        self.extensions.is_empty() || self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }

    /// Enqueue every new file in the inbox, in path order.
    pub async fn discover(&self, queue: &dyn FileQueue) -> Result<Vec<QueuedFile>, SchedulerError> {
        let listed = self.storage.list_all(true).await.context(DiscoverySnafu)?;
        let mut enqueued = Vec::new();

        for object in listed {
            let location = object.path.to_string();
            if !self.accepts(&location) {
                continue;
            }
            if queue
                .get(&location)
                .await
                .context(QueueStorageSnafu)?
                .is_some()
            {
                continue;
            }

            // A file that cannot be read now is still enqueued; the failed
            // attempt is recorded against it when it is processed.
            let raw_line_count = match self.storage.get(object.path.clone()).await {
                Ok(bytes) => match self.reader.count_lines(&bytes, &location) {
                    Ok(count) => Some(count),
                    Err(e) => {
                        warn!(file_id = %location, "Could not count lines: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!(file_id = %location, "Could not read new file: {}", e);
                    None
                }
            };

            let file_name = object.path.filename().unwrap_or(location.as_str());
            let business_day = business_day_from_name(file_name)
                .unwrap_or_else(|| object.last_modified.date_naive());

            let new_file = NewFile {
                file_id: location.clone(),
                business_day,
                location,
                raw_line_count,
            };
            if let Some(queued) = queue.enqueue(new_file).await.context(QueueStorageSnafu)? {
                debug!(
                    file_id = %queued.file_id,
                    lines = ?queued.raw_line_count,
                    "Discovered new file"
                );
                enqueued.push(queued);
            }
        }

        if !enqueued.is_empty() {
            info!("Discovered {} new files", enqueued.len());
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionFormat;
    use crate::storage::StorageProvider;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn test_business_day_from_name() {
        assert_eq!(
            business_day_from_name("VERMNTSB.6759_TDDF_2400_03012024_001537.TSYSO"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(
            business_day_from_name("tddf-20240415.tddf"),
            NaiveDate::from_ymd_opt(2024, 4, 15)
        );
        assert_eq!(business_day_from_name("no-date-here.TSYSO"), None);
        assert_eq!(business_day_from_name("run_123456789.TSYSO"), None);
    }

    #[tokio::test]
    async fn test_discover_enqueues_new_files_once() {
        let storage = Arc::new(
            StorageProvider::for_url("memory://discovery-test/inbox")
                .await
                .unwrap(),
        );
        storage
            .put("A_03012024.TSYSO", Bytes::from_static(b"l1\nl2\nl3\n"))
            .await
            .unwrap();
        storage
            .put("notes.txt", Bytes::from_static(b"ignore me"))
            .await
            .unwrap();

        let discovery = InboxDiscovery::new(
            storage.clone(),
            LineReader::new(CompressionFormat::None),
            vec![".TSYSO".to_string()],
        );
        let queue = MemoryStore::new();

        let found = discovery.discover(&queue).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_id, "A_03012024.TSYSO");
        assert_eq!(found[0].raw_line_count, Some(3));
        assert_eq!(found[0].business_day, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        assert!(discovery.discover(&queue).await.unwrap().is_empty());
    }
}
