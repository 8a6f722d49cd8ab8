//! Prometheus metrics for the consistency gate.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `linkgate_gate_decisions_total` | Counter | Gate decisions | `decision`, `outcome` |
//! | `linkgate_gate_attempts` | Histogram | Attempts per invocation | |
//! | `linkgate_gate_duration_seconds` | Histogram | Shaped response time | `decision` |
//! | `linkgate_store_check_duration_seconds` | Histogram | Per-check latency | `store`, `status` |
//! | `linkgate_degraded_allows_total` | Counter | Fail-open allows of indeterminate checks | |
//! | `linkgate_recovery_triggers_total` | Counter | Recovery trigger results | `status` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! let gate = ConsistencyGate::builder(config)
//!     .metrics(registry.gate_metrics().clone())
//!     .build()?;
//! let output = registry.encode_text()?;
//! ```

use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values to prevent denial-of-service via unbounded
/// labels.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for per-check store latency (in seconds).
pub const STORE_CHECK_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Buckets for shaped gate response time (in seconds).
pub const GATE_DURATION_BUCKETS: &[f64] = &[0.25, 0.4, 0.45, 0.5, 0.55, 0.6, 1.0, 2.5, 5.0];

/// Buckets for the attempt count histogram.
const ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 16.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Gate metrics.
///
/// All metrics use interior mutability and are safe to share across threads.
#[derive(Clone)]
pub struct GateMetrics {
    decisions_total: CounterVec,
    attempts: Histogram,
    gate_duration: HistogramVec,
    store_check_duration: HistogramVec,
    degraded_allows_total: Counter,
    recovery_triggers_total: CounterVec,
}

impl GateMetrics {
    /// Creates gate metrics and registers them with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let decisions_total = CounterVec::new(
            Opts::new("linkgate_gate_decisions_total", "Total gate decisions"),
            &["decision", "outcome"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let attempts = Histogram::with_opts(
            HistogramOpts::new("linkgate_gate_attempts", "Probe attempts per gate invocation")
                .buckets(ATTEMPT_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(attempts.clone()))?;

        let gate_duration = HistogramVec::new(
            HistogramOpts::new(
                "linkgate_gate_duration_seconds",
                "Gate response time after timing shaping",
            )
            .buckets(GATE_DURATION_BUCKETS.to_vec()),
            &["decision"],
        )?;
        registry.register(Box::new(gate_duration.clone()))?;

        let store_check_duration = HistogramVec::new(
            HistogramOpts::new(
                "linkgate_store_check_duration_seconds",
                "Latency of a single linkage store existence check",
            )
            .buckets(STORE_CHECK_BUCKETS.to_vec()),
            &["store", "status"],
        )?;
        registry.register(Box::new(store_check_duration.clone()))?;

        let degraded_allows_total = Counter::with_opts(Opts::new(
            "linkgate_degraded_allows_total",
            "Fail-open allows of indeterminate consistency checks",
        ))?;
        registry.register(Box::new(degraded_allows_total.clone()))?;

        let recovery_triggers_total = CounterVec::new(
            Opts::new(
                "linkgate_recovery_triggers_total",
                "Recovery trigger requests by result",
            ),
            &["status"],
        )?;
        registry.register(Box::new(recovery_triggers_total.clone()))?;

        Ok(Self {
            decisions_total,
            attempts,
            gate_duration,
            store_check_duration,
            degraded_allows_total,
            recovery_triggers_total,
        })
    }

    /// Records a completed gate invocation.
    pub fn decision_recorded(
        &self,
        decision: &str,
        outcome: &str,
        attempts: usize,
        duration_secs: f64,
    ) {
        self.decisions_total
            .with_label_values(&[truncate_label(decision), truncate_label(outcome)])
            .inc();
        #[allow(clippy::cast_precision_loss)] // bounded by MAX_ATTEMPTS_LIMIT
        self.attempts.observe(attempts as f64);
        self.gate_duration
            .with_label_values(&[truncate_label(decision)])
            .observe(duration_secs);
    }

    /// Returns the decision count for testing purposes.
    #[must_use]
    pub fn decision_count(&self, decision: &str, outcome: &str) -> f64 {
        self.decisions_total
            .with_label_values(&[truncate_label(decision), truncate_label(outcome)])
            .get()
    }

    /// Records the latency of one store check.
    pub fn store_check_observed(&self, store: &str, status: &str, latency_secs: f64) {
        self.store_check_duration
            .with_label_values(&[truncate_label(store), truncate_label(status)])
            .observe(latency_secs);
    }

    /// Returns the number of store checks observed for testing purposes.
    #[must_use]
    pub fn store_check_count(&self, store: &str, status: &str) -> u64 {
        self.store_check_duration
            .with_label_values(&[truncate_label(store), truncate_label(status)])
            .get_sample_count()
    }

    /// Records a degraded (fail-open) allow.
    pub fn degraded_allow(&self) {
        self.degraded_allows_total.inc();
    }

    /// Returns the number of degraded allows for testing purposes.
    #[must_use]
    pub fn degraded_allow_count(&self) -> f64 {
        self.degraded_allows_total.get()
    }

    /// Records a recovery trigger result (`enqueued`, `dropped`, `completed`,
    /// `failed`).
    pub fn recovery_trigger(&self, status: &str) {
        self.recovery_triggers_total
            .with_label_values(&[truncate_label(status)])
            .inc();
    }

    /// Returns the recovery trigger count for testing purposes.
    #[must_use]
    pub fn recovery_trigger_count(&self, status: &str) -> f64 {
        self.recovery_triggers_total
            .with_label_values(&[truncate_label(status)])
            .get()
    }
}

/// Metrics registry wrapper that holds the Prometheus registry and gate
/// metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    gate_metrics: GateMetrics,
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all gate metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let gate_metrics = GateMetrics::new(&registry)?;
        Ok(Self {
            registry,
            gate_metrics,
        })
    }

    /// Returns a reference to the gate metrics.
    #[must_use]
    pub const fn gate_metrics(&self) -> &GateMetrics {
        &self.gate_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Truncates a label value to [`MAX_LABEL_VALUE_LEN`] bytes on a character
/// boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().expect("registry");
        let metrics = registry.gate_metrics();
        metrics.decision_recorded("allow", "consistent", 1, 0.5);
        assert!((metrics.decision_count("allow", "consistent") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_encode_text_contains_families() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.gate_metrics();
        metrics.decision_recorded("block_recover", "orphan_incomplete_linkage", 1, 0.51);
        metrics.store_check_observed("orgs", "absent", 0.002);
        metrics.degraded_allow();
        metrics.recovery_trigger("enqueued");

        let text = registry.encode_text().unwrap();
        assert!(text.contains("linkgate_gate_decisions_total"));
        assert!(text.contains("linkgate_store_check_duration_seconds"));
        assert!(text.contains("linkgate_degraded_allows_total 1"));
        assert!(text.contains("linkgate_recovery_triggers_total{status=\"enqueued\"} 1"));
    }

    #[test]
    fn test_store_check_count() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.gate_metrics();
        metrics.store_check_observed("orgs", "found", 0.001);
        metrics.store_check_observed("orgs", "found", 0.002);
        assert_eq!(metrics.store_check_count("orgs", "found"), 2);
        assert_eq!(metrics.store_check_count("orgs", "errored"), 0);
    }

    #[test]
    fn test_truncate_label() {
        let long = "x".repeat(100);
        assert_eq!(truncate_label(&long).len(), MAX_LABEL_VALUE_LEN);

        let multibyte = "é".repeat(40);
        let truncated = truncate_label(&multibyte);
        assert!(truncated.len() <= MAX_LABEL_VALUE_LEN);
        assert!(multibyte.starts_with(truncated));
    }
}
