//! tddf-ingest: distributed batch processing of fixed-width TDDF files.
//!
//! Nodes discover files in an inbox, claim them one at a time through a
//! shared lease store, classify every line into a typed record, resolve
//! duplicate DT transactions and publish live throughput and backlog
//! figures over HTTP.
//!
//! # Example
//!
//! ```ignore
//! use tddf_ingest::{Config, run_node, error::PipelineError};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("config.yaml")?;
//!     let summary = run_node(config, CancellationToken::new()).await?;
//!     println!("Processed {} files", summary.processed_files);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod claim;
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod node;
pub mod record;
pub mod scheduler;
pub mod signal;
pub mod sink;
pub mod source;
pub mod status;
pub mod storage;
pub mod store;

// Re-export main types
pub use config::Config;
pub use node::{NodeSummary, run_node};
pub use record::{ClassifiedRecord, RawLine, RecordType, classify};
pub use storage::{StorageProvider, StorageProviderRef};
