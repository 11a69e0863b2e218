//! Passive collection of per-attempt measurements.
//!
//! The collector never influences admission decisions; it only
//! accumulates [`AttemptRecord`]s and renders them into a
//! [`RunSummary`] when a run finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::ratelimit::HostKey;
use crate::types::OutcomeKind;

/// Callback invoked once with the summary after a run completes
pub type MetricsCallback = Arc<dyn Fn(&RunSummary) + Send + Sync>;

/// One completed network attempt. Created by the engine after the
/// attempt finishes and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// The URL that was attempted
    pub url: String,
    /// Throttling key of the host
    pub host: HostKey,
    /// Index of the worker slot that ran the attempt
    pub worker: usize,
    /// 1-based attempt number within the URL's retry budget
    pub attempt: u32,
    /// Offset of the attempt start from the beginning of the run
    #[serde(with = "humantime_serde")]
    pub started: Duration,
    /// Offset of the attempt end from the beginning of the run
    #[serde(with = "humantime_serde")]
    pub finished: Duration,
    /// How the attempt was classified
    pub kind: OutcomeKind,
    /// HTTP status, if the attempt produced a response
    pub status: Option<u16>,
}

impl AttemptRecord {
    /// Wall-clock duration of the attempt
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.finished.saturating_sub(self.started)
    }
}

/// A (start, end, host, status) span on one worker's lane, for
/// external timeline visualizers
pub type TimelineSpan = (Duration, Duration, HostKey, Option<u16>);

/// Latency and outcome statistics for one finished run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Total attempts recorded
    pub total: u64,
    /// Successful attempts
    pub success: u64,
    /// Failed attempts (throttled, transient, and fatal)
    pub errors: u64,
    /// `errors / total`, 0.0 for an empty run
    pub error_rate: f64,
    /// Mean latency of successful attempts, seconds
    pub mean: Option<f64>,
    /// Population standard deviation of successful latencies, seconds
    pub std: Option<f64>,
    /// Latency percentiles of successful attempts, seconds
    pub p50: Option<f64>,
    /// 90th percentile
    pub p90: Option<f64>,
    /// 95th percentile
    pub p95: Option<f64>,
    /// 99th percentile
    pub p99: Option<f64>,
    /// Fastest successful attempt, seconds
    pub min: Option<f64>,
    /// Slowest successful attempt, seconds
    pub max: Option<f64>,
    /// Count per HTTP status code across all attempts
    pub status_counts: HashMap<u16, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    latencies: Vec<f64>,
    success: u64,
    errors: u64,
    status_counts: HashMap<u16, u64>,
    timeline: HashMap<usize, Vec<TimelineSpan>>,
}

/// Accumulates [`AttemptRecord`]s across a run
#[derive(Default)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    callback: Option<MetricsCallback>,
    finished: AtomicBool,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Create a collector, optionally with a completion callback
    #[must_use]
    pub fn new(callback: Option<MetricsCallback>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            callback,
            finished: AtomicBool::new(false),
        }
    }

    /// Record one completed attempt
    pub fn record(&self, record: &AttemptRecord) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = record.status {
            *inner.status_counts.entry(status).or_insert(0) += 1;
        }
        if record.kind == OutcomeKind::Success {
            inner.success += 1;
            inner.latencies.push(record.latency().as_secs_f64());
        } else {
            inner.errors += 1;
        }
        inner
            .timeline
            .entry(record.worker)
            .or_default()
            .push((record.started, record.finished, record.host.clone(), record.status));
    }

    /// Compute the summary over everything recorded so far
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn summary(&self) -> RunSummary {
        let inner = self.inner.lock().unwrap();
        let total = inner.success + inner.errors;
        let mut summary = RunSummary {
            total,
            success: inner.success,
            errors: inner.errors,
            error_rate: if total == 0 {
                0.0
            } else {
                inner.errors as f64 / total as f64
            },
            status_counts: inner.status_counts.clone(),
            ..RunSummary::default()
        };

        if inner.latencies.is_empty() {
            return summary;
        }

        let n = inner.latencies.len() as f64;
        let mean = inner.latencies.iter().sum::<f64>() / n;
        let sum_sq = inner.latencies.iter().map(|x| x * x).sum::<f64>();
        summary.mean = Some(mean);
        summary.std = Some((sum_sq / n - mean * mean).max(0.0).sqrt());

        let mut sorted = inner.latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let pct = |p: f64| {
            let idx = (p * (sorted.len() - 1) as f64) as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        summary.p50 = Some(pct(0.50));
        summary.p90 = Some(pct(0.90));
        summary.p95 = Some(pct(0.95));
        summary.p99 = Some(pct(0.99));
        summary.min = sorted.first().copied();
        summary.max = sorted.last().copied();
        summary
    }

    /// Per-worker attempt spans, for timeline rendering
    #[must_use]
    pub fn timeline(&self) -> HashMap<usize, Vec<TimelineSpan>> {
        self.inner.lock().unwrap().timeline.clone()
    }

    /// Compute the final summary and fire the callback.
    ///
    /// The callback runs at most once per collector, no matter how
    /// often `finish` is called.
    pub fn finish(&self) -> RunSummary {
        let summary = self.summary();
        if let Some(callback) = &self.callback {
            if !self.finished.swap(true, Ordering::SeqCst) {
                callback(&summary);
            }
        }
        summary
    }
}
