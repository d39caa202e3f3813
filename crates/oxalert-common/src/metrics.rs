//! In-process operator metrics.
//!
//! Every stage holds an `Arc<CoreMetrics>` and bumps the relevant counters;
//! the server logs a [`MetricsSnapshot`] periodically.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bounds (milliseconds) of the duration histogram buckets.
const DURATION_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        let mut buckets = Vec::with_capacity(self.buckets.len());
        for (i, b) in self.buckets.iter().enumerate() {
            let le = DURATION_BUCKETS_MS
                .get(i)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            buckets.push((le, b.load(Ordering::Relaxed)));
        }
        HistogramSnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_us as f64 / count as f64 / 1000.0
            },
            buckets,
        }
    }
}

/// All counters, gauges and histograms the core emits.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    pub metrics_received: Counter,
    pub metrics_valid: Counter,
    pub metrics_invalid: Counter,
    pub metrics_matched: Counter,
    pub metrics_saved: Counter,
    pub batch_save_failures: Counter,

    pub checks_total: Counter,
    pub check_duration: Histogram,
    pub check_errors_local: Counter,
    pub check_errors_remote: Counter,
    pub checks_skipped_locked: Counter,
    pub events_emitted: Counter,
    pub events_suppressed: Counter,

    pub event_queue_depth: Gauge,
    pub notification_queue_depth: Gauge,
    pub throttled_records: Gauge,

    pub notifications_enqueued: Counter,
    pub notifications_coalesced: Counter,
    pub notifications_sent: Counter,
    pub notifications_failed: Counter,
    pub notifications_requeued: Counter,
    pub notifications_dropped: Counter,

    pub worker_panics: Counter,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub buckets: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub metrics_received: u64,
    pub metrics_valid: u64,
    pub metrics_invalid: u64,
    pub metrics_matched: u64,
    pub metrics_saved: u64,
    pub batch_save_failures: u64,
    pub checks_total: u64,
    pub check_duration: HistogramSnapshot,
    pub check_errors_local: u64,
    pub check_errors_remote: u64,
    pub checks_skipped_locked: u64,
    pub events_emitted: u64,
    pub events_suppressed: u64,
    pub event_queue_depth: i64,
    pub notification_queue_depth: i64,
    pub throttled_records: i64,
    pub notifications_enqueued: u64,
    pub notifications_coalesced: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notifications_requeued: u64,
    pub notifications_dropped: u64,
    pub worker_panics: u64,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            metrics_received: self.metrics_received.get(),
            metrics_valid: self.metrics_valid.get(),
            metrics_invalid: self.metrics_invalid.get(),
            metrics_matched: self.metrics_matched.get(),
            metrics_saved: self.metrics_saved.get(),
            batch_save_failures: self.batch_save_failures.get(),
            checks_total: self.checks_total.get(),
            check_duration: self.check_duration.snapshot(),
            check_errors_local: self.check_errors_local.get(),
            check_errors_remote: self.check_errors_remote.get(),
            checks_skipped_locked: self.checks_skipped_locked.get(),
            events_emitted: self.events_emitted.get(),
            events_suppressed: self.events_suppressed.get(),
            event_queue_depth: self.event_queue_depth.get(),
            notification_queue_depth: self.notification_queue_depth.get(),
            throttled_records: self.throttled_records.get(),
            notifications_enqueued: self.notifications_enqueued.get(),
            notifications_coalesced: self.notifications_coalesced.get(),
            notifications_sent: self.notifications_sent.get(),
            notifications_failed: self.notifications_failed.get(),
            notifications_requeued: self.notifications_requeued.get(),
            notifications_dropped: self.notifications_dropped.get(),
            worker_panics: self.worker_panics.get(),
        }
    }
}
