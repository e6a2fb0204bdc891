//! Error types for tddf-ingest using snafu.
//!
//! Each subsystem has its own error enum with context selectors. Line-level
//! decode problems are not errors at all: they become `SKIPPED` records.

use snafu::prelude::*;

use crate::metrics::events::FailureStage;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Node id is empty.
    #[snafu(display("Node id cannot be empty"))]
    EmptyNodeId,

    /// Source path is empty.
    #[snafu(display("Source path cannot be empty"))]
    EmptySourcePath,

    /// Heartbeats would not keep a claim alive.
    #[snafu(display(
        "Heartbeat interval ({heartbeat_secs}s) must be shorter than the claim TTL ({ttl_secs}s)"
    ))]
    HeartbeatTooSlow { heartbeat_secs: u64, ttl_secs: u64 },

    /// Files must be attempted at least once.
    #[snafu(display("max_attempts must be at least 1"))]
    ZeroMaxAttempts,

    /// The rolling metrics window is empty.
    #[snafu(display("Metrics window must be longer than zero seconds"))]
    ZeroMetricsWindow,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Reader Errors ============

/// Errors that can occur while turning a stored file into raw lines.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReaderError {
    /// Gzip decompression failed.
    #[snafu(display("Gzip decompression failed for {path}"))]
    GzipDecompression {
        source: std::io::Error,
        path: String,
    },

    /// Zstd decompression failed.
    #[snafu(display("Zstd decompression failed for {path}"))]
    ZstdDecompression {
        source: std::io::Error,
        path: String,
    },
}

// ============ Claim Errors ============

/// Errors raised by the claim store and coordinator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClaimError {
    /// Another writer is mutating the same claim row right now.
    #[snafu(display("Claim for {file_id} is being modified concurrently"))]
    Contention { file_id: String },

    /// The caller does not hold an active claim on the file.
    #[snafu(display("Node {node_id} does not own an active claim on {file_id}"))]
    NotOwner { file_id: String, node_id: String },

    /// Lease file IO failed.
    #[snafu(display("Claim IO failed for {path}"))]
    ClaimIo {
        source: std::io::Error,
        path: String,
    },

    /// Lease file contents could not be (de)serialized.
    #[snafu(display("Claim record for {file_id} is unreadable"))]
    ClaimSerde {
        source: serde_json::Error,
        file_id: String,
    },
}

impl ClaimError {
    /// Transient errors are retried with backoff; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClaimError::Contention { .. })
    }
}

// ============ Store Errors ============

/// Errors raised by the file queue and result store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The file is not known to the queue.
    #[snafu(display("File {file_id} is not in the queue"))]
    UnknownFile { file_id: String },
}

// ============ Sink Errors ============

/// Errors that can occur while exporting committed results.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Failed to create the sink storage provider.
    #[snafu(display("Failed to create sink storage"))]
    SinkStorage { source: StorageError },

    /// Failed to serialize a record or summary.
    #[snafu(display("Failed to serialize export for {file_id}"))]
    SinkSerialize {
        source: serde_json::Error,
        file_id: String,
    },

    /// Failed to write the export.
    #[snafu(display("Failed to write export for {file_id}"))]
    SinkWrite {
        source: StorageError,
        file_id: String,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix avoids snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize failed file record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ File Errors ============

/// A failure that aborts processing of a single file.
///
/// These are recorded against the file and retried on a later tick; they
/// never stop the scheduler.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FileError {
    /// The file could not be fetched from storage.
    #[snafu(display("Failed to read {location}"))]
    FetchFile {
        source: StorageError,
        location: String,
    },

    /// The file could not be decompressed.
    #[snafu(display("Failed to decode file"))]
    DecodeFile { source: ReaderError },

    /// The classification task panicked or was cancelled.
    #[snafu(display("Classification task failed"))]
    ClassifyTask { source: tokio::task::JoinError },

    /// Results could not be committed.
    #[snafu(display("Failed to persist results"))]
    PersistResults { source: StoreError },

    /// Results could not be exported.
    #[snafu(display("Failed to export results"))]
    ExportResults { source: SinkError },
}

impl FileError {
    /// Stage at which the file failed, for metrics and the DLQ.
    pub fn stage(&self) -> FailureStage {
        match self {
            FileError::FetchFile { .. } => FailureStage::Fetch,
            FileError::DecodeFile { .. } => FailureStage::Decompress,
            FileError::ClassifyTask { .. } => FailureStage::Classify,
            FileError::PersistResults { .. } => FailureStage::Persist,
            FileError::ExportResults { .. } => FailureStage::Export,
        }
    }
}

// ============ Scheduler Errors ============

/// Errors that abort a whole scheduler tick.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchedulerError {
    /// Claim storage is unreachable.
    #[snafu(display("Claim storage failed"))]
    ClaimStorage { source: ClaimError },

    /// Queue storage is unreachable.
    #[snafu(display("Queue storage failed"))]
    QueueStorage { source: StoreError },

    /// Inbox discovery failed.
    #[snafu(display("Inbox discovery failed"))]
    Discovery { source: StorageError },

    /// The scheduler loop has exited and no longer takes commands.
    #[snafu(display("Scheduler is not running"))]
    Stopped,
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Claim store could not be opened.
    #[snafu(display("Claim store error"))]
    ClaimSetup { source: ClaimError },

    /// Scheduler error.
    #[snafu(display("Scheduler error"))]
    Scheduler { source: SchedulerError },

    /// Sink error.
    #[snafu(display("Sink error"))]
    Sink { source: SinkError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },
}
