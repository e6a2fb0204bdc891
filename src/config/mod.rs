//! Configuration loading and validation.
//!
//! Configuration is a YAML file with environment variable interpolation
//! applied before parsing. Every section except `node` and `source` is
//! optional and falls back to defaults.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyNodeIdSnafu, EmptySourcePathSnafu, EnvInterpolationSnafu,
    HeartbeatTooSlowSnafu, ReadFileSnafu, YamlParseSnafu, ZeroMaxAttemptsSnafu,
    ZeroMetricsWindowSnafu,
};

pub use vars::interpolate;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub claims: ClaimConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Optional export of committed results.
    #[serde(default)]
    pub sink: Option<SinkConfig>,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Identity of this worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique id used as the claim owner.
    pub id: String,
}

/// Where raw TDDF files arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Storage URL of the inbox.
    /// Examples: "s3://bucket/tddf/inbox", "/var/lib/tddf/inbox"
    pub path: String,

    /// Compression format of input files.
    #[serde(default)]
    pub compression: CompressionFormat,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Only files ending in one of these suffixes are enqueued.
    /// Empty accepts every file.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec![".TSYSO".to_string(), ".tddf".to_string()]
}

/// Compression format for source files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduled ticks (default: 60).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Random jitter added to each wait, 0 to N seconds (default: 0).
    #[serde(default)]
    pub poll_jitter_secs: u64,

    /// Attempts before a file is marked permanently failed (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// List the source inbox on every tick and enqueue new files (default: true).
    #[serde(default = "default_true")]
    pub auto_discover: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_jitter_secs: 0,
            max_attempts: default_max_attempts(),
            auto_discover: true,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Which claim store backs the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClaimBackend {
    /// Process-local store; only coordinates nodes in the same process.
    #[default]
    Memory,
    /// Lease files in a directory shared by all nodes.
    Directory { path: String },
}

/// File claim lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    #[serde(default)]
    pub backend: ClaimBackend,

    /// Seconds without a heartbeat before a claim is stale (default: 300).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between heartbeats while a file is processing (default: 60).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Retries on transient claim contention (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between contention retries in milliseconds (default: 250).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            backend: ClaimBackend::default(),
            ttl_secs: default_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ClaimConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

/// Duplicate resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Duplicates per group that are counted as increments; the rest are
    /// skipped (default: 10).
    #[serde(default = "default_max_duplicates_per_group")]
    pub max_duplicates_per_group: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_duplicates_per_group: default_max_duplicates_per_group(),
        }
    }
}

fn default_max_duplicates_per_group() -> usize {
    10
}

/// Metrics configuration for the Prometheus endpoint and rolling statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the HTTP endpoint is served (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,

    /// Rolling window for rates and peaks in seconds (default: 600).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Seconds between metric samples (default: 15).
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    /// Throughput floor used when estimating backlog ETA (default: 1.0).
    #[serde(default = "default_min_throughput_per_minute")]
    pub min_throughput_per_minute: f64,

    /// Number of samples retained in history (default: 2880).
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            window_secs: default_window_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            min_throughput_per_minute: default_min_throughput_per_minute(),
            retention: default_retention(),
        }
    }
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_window_secs() -> u64 {
    600
}

fn default_sample_interval_secs() -> u64 {
    15
}

fn default_min_throughput_per_minute() -> f64 {
    1.0
}

fn default_retention() -> usize {
    2880
}

/// Export destination for committed results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Storage URL of the export root.
    pub path: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Error handling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Path to write permanently failed file records (enables the DLQ).
    #[serde(default)]
    pub dlq_path: Option<String>,

    /// Storage options for DLQ (credentials, region, etc.)
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = vars::interpolate(content);
            if !result.is_ok() {
                return EnvInterpolationSnafu {
                    message: result.errors.join("\n"),
                }
                .fail();
            }
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.node.id.trim().is_empty(), EmptyNodeIdSnafu);
        ensure!(!self.source.path.is_empty(), EmptySourcePathSnafu);
        ensure!(self.scheduler.max_attempts > 0, ZeroMaxAttemptsSnafu);
        ensure!(self.metrics.window_secs > 0, ZeroMetricsWindowSnafu);
        ensure!(
            self.claims.heartbeat_interval_secs < self.claims.ttl_secs,
            HeartbeatTooSlowSnafu {
                heartbeat_secs: self.claims.heartbeat_interval_secs,
                ttl_secs: self.claims.ttl_secs,
            }
        );
        Ok(())
    }
}
