//! DLQ record and statistics types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::events::FailureStage;

/// A permanently failed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub file_id: String,
    /// Storage location the file was read from.
    pub location: String,
    /// Error of the final attempt.
    pub error: String,
    pub stage: FailureStage,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

/// Failure counts by stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub fetch: usize,
    pub decompress: usize,
    pub classify: usize,
    pub persist: usize,
    pub export: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Fetch => self.fetch += 1,
            FailureStage::Decompress => self.decompress += 1,
            FailureStage::Classify => self.classify += 1,
            FailureStage::Persist => self.persist += 1,
            FailureStage::Export => self.export += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetch + self.decompress + self.classify + self.persist + self.export
    }
}
