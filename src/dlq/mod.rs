//! Dead Letter Queue for permanently failed files.
//!
//! A file that exhausts its attempts is recorded here with the stage and
//! error of its last failure. Records are written as NDJSON to a configurable
//! storage location for later inspection and requeueing.

mod queue;
mod types;

pub use queue::DeadLetterQueue;
pub use types::{FailedFile, FailureStats};
