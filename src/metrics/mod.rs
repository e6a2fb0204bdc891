//! Metrics and observability.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus exporter and the HTTP listener
//! - `aggregator`: rolling throughput window, peaks and backlog ETA

pub mod aggregator;
pub mod events;
pub mod server;

pub use aggregator::{
    MetricSample, MetricsAggregator, PerformanceWindow, SharedAggregator, backlog_eta, run_sampler,
};
pub use server::{init, serve};

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// use tddf_ingest::metrics::events::{FileProcessed, FileStatus};
///
/// emit!(FileProcessed { status: FileStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
