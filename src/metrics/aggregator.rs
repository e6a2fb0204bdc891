//! Rolling throughput statistics.
//!
//! The aggregator is fed cumulative record counters on a fixed interval and
//! turns consecutive snapshots into readings. Readings with activity are
//! kept for the trailing window; rates, the peak and the backlog ETA are
//! derived from them.
//!
//! The peak only ever rises while readings remain in the window. It drops
//! back to zero once the window has emptied, i.e. after a full window of
//! inactivity, never because one recent reading was low.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::emit;
use crate::metrics::events::{QueueDepth, ThroughputSampled};
use crate::record::{RecordCounts, RecordType};
use crate::store::{FileQueueRef, ResultStoreRef};

pub type SharedAggregator = Arc<RwLock<MetricsAggregator>>;

/// One appended point of the metrics time series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    /// Records classified per type since the previous sample.
    pub record_type_counts: BTreeMap<RecordType, u64>,
    pub transactions_per_second: f64,
    pub records_per_minute: f64,
    /// Peak records per minute over the current window.
    pub peak_value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Read-only view of the window, used by the status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceWindow {
    pub has_data: bool,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Rates of the most recent reading.
    pub records_per_minute: f64,
    pub transactions_per_second: f64,
    pub tddf_records_per_second: f64,
    /// Averages over the whole window.
    pub average_records_per_minute: f64,
    pub average_tddf_per_minute: f64,
    pub peak_records_per_minute: f64,
    pub peak_at: Option<DateTime<Utc>>,
    pub record_type_counts: BTreeMap<RecordType, u64>,
    pub pending_raw_lines: u64,
    pub backlog_eta: String,
}

#[derive(Debug, Clone)]
struct Reading {
    at: DateTime<Utc>,
    interval_secs: f64,
    /// All classified lines, skipped included.
    records: u64,
    /// Non-skipped records.
    tddf_records: u64,
    transactions: u64,
    per_type: BTreeMap<RecordType, u64>,
}

impl Reading {
    fn records_per_minute(&self) -> f64 {
        per_minute(self.records, self.interval_secs)
    }
}

fn per_second(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

fn per_minute(count: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        count as f64 * 60.0 / secs
    } else {
        0.0
    }
}

/// Running maximum with the time it was reached.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakTracker {
    pub value: f64,
    pub at: Option<DateTime<Utc>>,
}

impl PeakTracker {
    fn observe(&mut self, value: f64, at: DateTime<Utc>) {
        if value > self.value {
            self.value = value;
            self.at = Some(at);
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Format a backlog ETA as `"Xm"` or `"Xh Ym"`; `"0"` when nothing is pending
/// or nothing is moving.
pub fn backlog_eta(pending: i64, throughput_per_minute: f64, floor_per_minute: f64) -> String {
    if pending <= 0 || throughput_per_minute <= 0.0 || !throughput_per_minute.is_finite() {
        return "0".to_string();
    }
    let rate = throughput_per_minute.max(floor_per_minute);
    let minutes = (pending as f64 / rate).ceil() as u64;
    if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

pub struct MetricsAggregator {
    window: Duration,
    /// How long the latest reading still counts as current throughput.
    current_for: Duration,
    min_throughput_per_minute: f64,
    retention: usize,
    readings: VecDeque<Reading>,
    peak: PeakTracker,
    last_totals: Option<(DateTime<Utc>, RecordCounts)>,
    pending_raw_lines: u64,
    history: VecDeque<MetricSample>,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            window: config.window(),
            current_for: config.sample_interval() * 2,
            min_throughput_per_minute: config.min_throughput_per_minute,
            retention: config.retention.max(1),
            readings: VecDeque::new(),
            peak: PeakTracker::default(),
            last_totals: None,
            pending_raw_lines: 0,
            history: VecDeque::new(),
        }
    }

    fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX)
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let window = self.window_delta();
        while self
            .readings
            .front()
            .is_some_and(|r| now.signed_duration_since(r.at) > window)
        {
            self.readings.pop_front();
        }
        if self.readings.is_empty() && self.peak.value > 0.0 {
            debug!("Metrics window empty, resetting peak");
            self.peak.reset();
        }
    }

    /// Take a sample from cumulative counters.
    ///
    /// The first call only establishes the baseline. Counters that shrank
    /// (a file's result replaced by a smaller one) contribute zero.
    pub fn sample(
        &mut self,
        now: DateTime<Utc>,
        totals: &RecordCounts,
        pending_raw_lines: u64,
    ) -> MetricSample {
        self.pending_raw_lines = pending_raw_lines;

        let reading = self.last_totals.as_ref().map(|(at, previous)| {
            let interval_secs = now.signed_duration_since(*at).num_milliseconds() as f64 / 1000.0;
            let mut per_type = BTreeMap::new();
            for record_type in RecordType::KNOWN.into_iter().chain([RecordType::Other]) {
                let delta = totals
                    .processed_of(record_type)
                    .saturating_sub(previous.processed_of(record_type));
                if delta > 0 {
                    per_type.insert(record_type, delta);
                }
            }
            let skipped = totals.total_skipped().saturating_sub(previous.total_skipped());
            if skipped > 0 {
                per_type.insert(RecordType::Skipped, skipped);
            }
            Reading {
                at: now,
                interval_secs,
                records: totals.total_lines.saturating_sub(previous.total_lines),
                tddf_records: totals
                    .total_processed()
                    .saturating_sub(previous.total_processed()),
                transactions: per_type.get(&RecordType::DT).copied().unwrap_or(0),
                per_type,
            }
        });
        self.last_totals = Some((now, totals.clone()));

        let (record_type_counts, records_per_minute, transactions_per_second) = match reading {
            Some(reading) if reading.records > 0 => {
                let rpm = reading.records_per_minute();
                let tps = per_second(reading.transactions, reading.interval_secs);
                let counts = reading.per_type.clone();
                self.readings.push_back(reading);
                (counts, rpm, tps)
            }
            _ => (BTreeMap::new(), 0.0, 0.0),
        };

        self.evict(now);
        if records_per_minute > 0.0 {
            self.peak.observe(records_per_minute, now);
        }

        let sample = MetricSample {
            timestamp: now,
            record_type_counts,
            transactions_per_second,
            records_per_minute,
            peak_value: self.peak.value,
            window_start: now - self.window_delta(),
            window_end: now,
        };

        emit!(ThroughputSampled {
            records_per_minute,
            peak_records_per_minute: self.peak.value,
        });

        self.history.push_back(sample.clone());
        while self.history.len() > self.retention {
            self.history.pop_front();
        }
        sample
    }

    pub fn history(&self) -> impl Iterator<Item = &MetricSample> {
        self.history.iter()
    }

    /// Snapshot of the window as of `now`. Never fails; an empty window
    /// reports zero rates and `has_data = false`.
    pub fn status(&self, now: DateTime<Utc>) -> PerformanceWindow {
        let window = self.window_delta();
        let live: Vec<&Reading> = self
            .readings
            .iter()
            .filter(|r| now.signed_duration_since(r.at) <= window)
            .collect();

        // No fresh reading means nothing has moved since; older readings only
        // feed the window averages.
        let current_for = TimeDelta::from_std(self.current_for).unwrap_or(TimeDelta::MAX);
        let latest = live
            .last()
            .filter(|r| now.signed_duration_since(r.at) <= current_for);
        let records_per_minute = latest.map(|r| r.records_per_minute()).unwrap_or(0.0);
        let transactions_per_second = latest
            .map(|r| per_second(r.transactions, r.interval_secs))
            .unwrap_or(0.0);
        let tddf_records_per_second = latest
            .map(|r| per_second(r.tddf_records, r.interval_secs))
            .unwrap_or(0.0);

        let covered_secs: f64 = live.iter().map(|r| r.interval_secs).sum();
        let average_records_per_minute =
            per_minute(live.iter().map(|r| r.records).sum(), covered_secs);
        let average_tddf_per_minute =
            per_minute(live.iter().map(|r| r.tddf_records).sum(), covered_secs);

        let mut record_type_counts = BTreeMap::new();
        for reading in &live {
            for (record_type, count) in &reading.per_type {
                *record_type_counts.entry(*record_type).or_default() += count;
            }
        }

        // An empty window means the peak is due for reset on the next sample.
        let peak = if live.is_empty() {
            PeakTracker::default()
        } else {
            self.peak
        };

        PerformanceWindow {
            has_data: !live.is_empty(),
            window_start: now - window,
            window_end: now,
            records_per_minute,
            transactions_per_second,
            tddf_records_per_second,
            average_records_per_minute,
            average_tddf_per_minute,
            peak_records_per_minute: peak.value,
            peak_at: peak.at,
            record_type_counts,
            pending_raw_lines: self.pending_raw_lines,
            backlog_eta: backlog_eta(
                self.pending_raw_lines as i64,
                records_per_minute,
                self.min_throughput_per_minute,
            ),
        }
    }
}

/// Sample the stores every `interval` until `shutdown` fires.
pub async fn run_sampler(
    aggregator: SharedAggregator,
    results: ResultStoreRef,
    queue: FileQueueRef,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let counters = match results.counters().await {
            Ok(counters) => counters,
            Err(e) => {
                warn!("Skipping metrics sample, result store unavailable: {}", e);
                continue;
            }
        };
        let stats = match queue.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Skipping metrics sample, queue unavailable: {}", e);
                continue;
            }
        };

        emit!(QueueDepth {
            files: stats.queued_files,
            raw_lines: stats.pending_raw_lines,
        });

        let sample = aggregator
            .write()
            .await
            .sample(Utc::now(), &counters.records, stats.pending_raw_lines);
        debug!(
            records_per_minute = sample.records_per_minute,
            peak = sample.peak_value,
            "Metrics sampled"
        );
    }
}
