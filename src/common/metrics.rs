//! Counters and histograms for external scraping.
//!
//! The core only increments these; exposition is either a serde snapshot or
//! Prometheus text rendered on demand.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Millisecond bucket boundaries for promotion latency.
const PROMOTION_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 20, 50, 100, 250, 500, 1_000];
/// Millisecond bucket boundaries for training run duration.
const RUN_BUCKETS_MS: [u64; 8] = [
    1_000, 10_000, 60_000, 300_000, 900_000, 1_800_000, 3_600_000, 7_200_000,
];

/// Fixed-bucket histogram with cumulative export.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn observe(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time histogram values. `counts` has one extra overflow bucket.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub bounds: Vec<u64>,
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum: u64,
}

/// Process-wide instrumentation shared by every component.
#[derive(Debug)]
pub struct Telemetry {
    pub submissions_accepted: AtomicU64,
    pub submissions_rejected: AtomicU64,
    pub versions_created: AtomicU64,
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub selection_queries: AtomicU64,
    pub promotion_ms: Histogram,
    pub run_duration_ms: Histogram,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            submissions_accepted: AtomicU64::new(0),
            submissions_rejected: AtomicU64::new(0),
            versions_created: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            selection_queries: AtomicU64::new(0),
            promotion_ms: Histogram::new(&PROMOTION_BUCKETS_MS),
            run_duration_ms: Histogram::new(&RUN_BUCKETS_MS),
        }
    }
}

/// Serializable copy of every metric.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub submissions_accepted: u64,
    pub submissions_rejected: u64,
    pub versions_created: u64,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub selection_queries: u64,
    pub promotion_ms: HistogramSnapshot,
    pub run_duration_ms: HistogramSnapshot,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            submissions_accepted: self.submissions_accepted.load(Ordering::Relaxed),
            submissions_rejected: self.submissions_rejected.load(Ordering::Relaxed),
            versions_created: self.versions_created.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            selection_queries: self.selection_queries.load(Ordering::Relaxed),
            promotion_ms: self.promotion_ms.snapshot(),
            run_duration_ms: self.run_duration_ms.snapshot(),
        }
    }

    /// Render the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let counters = [
            ("retrain_submissions_accepted_total", snap.submissions_accepted),
            ("retrain_submissions_rejected_total", snap.submissions_rejected),
            ("retrain_versions_created_total", snap.versions_created),
            ("retrain_runs_started_total", snap.runs_started),
            ("retrain_runs_succeeded_total", snap.runs_succeeded),
            ("retrain_runs_failed_total", snap.runs_failed),
            ("retrain_runs_cancelled_total", snap.runs_cancelled),
            ("retrain_selection_queries_total", snap.selection_queries),
        ];
        for (name, value) in counters {
            let _ = writeln!(out, "# TYPE {name} counter\n{name} {value}");
        }
        render_histogram(&mut out, "retrain_promotion_ms", &snap.promotion_ms);
        render_histogram(&mut out, "retrain_run_duration_ms", &snap.run_duration_ms);
        out
    }
}

fn render_histogram(out: &mut String, name: &str, snap: &HistogramSnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0;
    for (bound, count) in snap.bounds.iter().zip(&snap.counts) {
        cumulative += count;
        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", snap.count);
    let _ = writeln!(out, "{name}_sum {}", snap.sum);
    let _ = writeln!(out, "{name}_count {}", snap.count);
}
