//! Flush-cycle counters.
//!
//! [`EngineMetrics`] keeps process-local atomic counters that callers read
//! through [`MetricsSnapshot`], and mirrors every update to the `metrics`
//! facade so an installed exporter (Prometheus in the demo binary) sees the
//! same numbers. Without an installed recorder the facade calls are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;

/// Point-in-time copy of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Non-empty batches handed to the worker.
    pub flush_count: u64,
    /// Batches the worker processed successfully.
    pub success_count: u64,
    /// Batches the worker failed on.
    pub failure_count: u64,
    /// Cycles skipped because another flush was already in progress.
    pub skipped_count: u64,
    /// Records in successful batches.
    pub records_processed: u64,
    /// Records in failed batches.
    pub records_failed: u64,
}

/// Monotonic counters owned by one engine, written only by its flush cycle.
#[derive(Debug)]
pub struct EngineMetrics {
    engine: String,
    flush_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    skipped_count: AtomicU64,
    records_processed: AtomicU64,
    records_failed: AtomicU64,
}

impl EngineMetrics {
    /// Creates zeroed counters labelled with `engine`.
    #[must_use]
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            flush_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        counter!("bufio_flush_total", "engine" => self.engine.clone()).increment(1);
    }

    pub(crate) fn record_success(&self, records: usize, elapsed: Duration) {
        let records = records as u64;
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.records_processed.fetch_add(records, Ordering::Relaxed);
        counter!("bufio_flush_success_total", "engine" => self.engine.clone()).increment(1);
        counter!("bufio_records_processed_total", "engine" => self.engine.clone())
            .increment(records);
        self.record_duration(elapsed);
    }

    pub(crate) fn record_failure(&self, records: usize, elapsed: Duration) {
        let records = records as u64;
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.records_failed.fetch_add(records, Ordering::Relaxed);
        counter!("bufio_flush_failure_total", "engine" => self.engine.clone()).increment(1);
        counter!("bufio_records_failed_total", "engine" => self.engine.clone()).increment(records);
        self.record_duration(elapsed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped_count.fetch_add(1, Ordering::Relaxed);
        counter!("bufio_flush_skipped_total", "engine" => self.engine.clone()).increment(1);
    }

    fn record_duration(&self, elapsed: Duration) {
        histogram!("bufio_flush_duration_seconds", "engine" => self.engine.clone())
            .record(elapsed.as_secs_f64());
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flush_count: self.flush_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            skipped_count: self.skipped_count.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
        }
    }
}
