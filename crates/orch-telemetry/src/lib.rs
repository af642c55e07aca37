// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Structured logging bootstrap and per-run metrics collection for the job
//! orchestrator's three processes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Logging bootstrap
// ---------------------------------------------------------------------------

/// Output format for the global tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact text, for local/dev use.
    Text,
    /// Newline-delimited JSON, for ingestion by a log pipeline.
    Json,
}

/// Initialize the global `tracing` subscriber from a `log_level` string and
/// a chosen [`LogFormat`].
///
/// Scopes the default filter to `orch=<level>` so dependency crates stay
/// quiet unless the caller broadens `RUST_LOG` themselves. Returns an error
/// string rather than panicking if a subscriber is already installed (tests
/// may call this more than once within a process).
pub fn init_tracing(log_level: &str, format: LogFormat) -> Result<(), String> {
    let filter = EnvFilter::try_new(format!("orch={log_level}"))
        .unwrap_or_else(|_| EnvFilter::new("orch=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// RunMetrics
// ---------------------------------------------------------------------------

/// Metrics captured for a single controller invocation against one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    /// The run this invocation acted on.
    pub run_id: String,
    /// Wall-clock duration of the invocation, in milliseconds.
    pub duration_ms: u64,
    /// Number of orders dispatched this invocation.
    pub dispatched_count: u64,
    /// Number of orders cascade-failed this invocation.
    pub cascade_failed_count: u64,
    /// Number of store-adapter retries consumed this invocation.
    pub retry_count: u64,
    /// `true` iff this invocation finalized the run.
    pub finalized: bool,
    /// `true` iff this invocation was skipped due to lock contention.
    pub skipped: bool,
}

// ---------------------------------------------------------------------------
// MetricsSummary
// ---------------------------------------------------------------------------

/// Aggregated statistics across multiple controller invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of invocations recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total orders dispatched across all invocations.
    pub total_dispatched: u64,
    /// Total orders cascade-failed across all invocations.
    pub total_cascade_failed: u64,
    /// Total store-adapter retries consumed.
    pub total_retries: u64,
    /// Number of invocations that finalized their run.
    pub finalized_count: usize,
    /// Number of invocations skipped due to lock contention.
    pub skipped_count: usize,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_dispatched: 0,
            total_cascade_failed: 0,
            total_retries: 0,
            finalized_count: 0,
            skipped_count: 0,
        }
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Thread-safe collector for controller-invocation metrics.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<RunMetrics>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new, empty collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record one controller invocation's metrics.
    pub fn record(&self, metrics: RunMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Return all recorded invocations.
    pub fn runs(&self) -> Vec<RunMetrics> {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.clone()
    }

    /// Number of invocations recorded so far.
    pub fn len(&self) -> usize {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.len()
    }

    /// Whether the collector has no recorded invocations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded invocations.
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let total_duration: u64 = durations.iter().sum();
        let mean_duration_ms = total_duration as f64 / count as f64;
        let p99_duration_ms = percentile(&durations, 99.0);

        MetricsSummary {
            count,
            mean_duration_ms,
            p99_duration_ms,
            total_dispatched: data.iter().map(|r| r.dispatched_count).sum(),
            total_cascade_failed: data.iter().map(|r| r.cascade_failed_count).sum(),
            total_retries: data.iter().map(|r| r.retry_count).sum(),
            finalized_count: data.iter().filter(|r| r.finalized).count(),
            skipped_count: data.iter().filter(|r| r.skipped).count(),
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.clear();
    }
}

// ---------------------------------------------------------------------------
// TelemetrySpan
// ---------------------------------------------------------------------------

/// A structured span builder, for ad-hoc one-off events that don't fit the
/// `tracing` macros cleanly (e.g. relaying store-adapter diagnostics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        tracing::info!(span_name = %self.name, attributes = ?self.attributes, "telemetry_span");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_id: &str, duration_ms: u64) -> RunMetrics {
        RunMetrics {
            run_id: run_id.to_string(),
            duration_ms,
            dispatched_count: 2,
            cascade_failed_count: 0,
            retry_count: 1,
            finalized: false,
            skipped: false,
        }
    }

    #[test]
    fn collector_new_is_empty() {
        let c = MetricsCollector::new();
        assert!(c.is_empty());
    }

    #[test]
    fn collector_record_and_summary() {
        let c = MetricsCollector::new();
        c.record(sample("run-1", 100));
        c.record(sample("run-2", 200));
        let s = c.summary();
        assert_eq!(s.count, 2);
        assert_eq!(s.mean_duration_ms, 150.0);
        assert_eq!(s.total_dispatched, 4);
        assert_eq!(s.total_retries, 2);
    }

    #[test]
    fn summary_counts_finalized_and_skipped() {
        let c = MetricsCollector::new();
        let mut finalized = sample("run-1", 50);
        finalized.finalized = true;
        let mut skipped = sample("run-2", 10);
        skipped.skipped = true;
        c.record(finalized);
        c.record(skipped);
        c.record(sample("run-3", 20));
        let s = c.summary();
        assert_eq!(s.finalized_count, 1);
        assert_eq!(s.skipped_count, 1);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let c = MetricsCollector::new();
        let s = c.summary();
        assert_eq!(s.count, 0);
        assert_eq!(s.mean_duration_ms, 0.0);
    }

    #[test]
    fn clear_empties_collector() {
        let c = MetricsCollector::new();
        c.record(sample("run-1", 10));
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn telemetry_span_attributes() {
        let span = TelemetrySpan::new("dispatch").with_attribute("order_num", "0001");
        assert_eq!(span.attributes["order_num"], "0001");
    }

    #[test]
    fn percentile_single_value() {
        assert_eq!(percentile(&[42], 99.0), 42.0);
    }

    #[test]
    fn percentile_empty_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
