//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, Histogram, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_counter_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Turn metrics
    pub turns: CounterVec,
    pub turn_duration: Histogram,
    pub frames_emitted: Counter,
    pub duplicate_deltas: Counter,
    pub lost_writes: Counter,
    pub commit_conflicts: Counter,

    // Admission metrics
    pub admissions: CounterVec,

    // Upstream metrics
    pub upstream_requests: CounterVec,
    pub upstream_request_duration: HistogramVec,

    // HTTP metrics
    pub chat_request_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let turns = register_counter_vec_with_registry!(
            Opts::new("turns_total", "Turn sessions by final outcome"),
            &["outcome"],
            registry
        )?;

        let turn_duration = register_histogram_with_registry!(
            "turn_duration_seconds",
            "Wall-clock duration of a streamed turn",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            registry
        )?;

        let frames_emitted = register_counter_with_registry!(
            Opts::new("frames_emitted_total", "Content frames written to clients"),
            registry
        )?;

        let duplicate_deltas = register_counter_with_registry!(
            Opts::new("duplicate_deltas_total", "Opening deltas suppressed as duplicates"),
            registry
        )?;

        let lost_writes = register_counter_with_registry!(
            Opts::new("lost_writes_total", "Streamed turns that failed to persist"),
            registry
        )?;

        let commit_conflicts = register_counter_with_registry!(
            Opts::new("commit_conflicts_total", "History appends retried after a stale read"),
            registry
        )?;

        let admissions = register_counter_vec_with_registry!(
            Opts::new("admissions_total", "Quota gate decisions"),
            &["decision"],
            registry
        )?;

        let upstream_requests = register_counter_vec_with_registry!(
            Opts::new("upstream_requests_total", "Upstream assistant requests"),
            &["operation", "status"],
            registry
        )?;

        let upstream_request_duration = register_histogram_vec_with_registry!(
            "upstream_request_duration_seconds",
            "Upstream request duration in seconds",
            &["operation"],
            registry
        )?;

        let chat_request_duration = register_histogram_vec_with_registry!(
            "chat_request_duration_seconds",
            "Chat API request duration in seconds",
            &["endpoint"],
            registry
        )?;

        Ok(Self {
            registry,
            turns,
            turn_duration,
            frames_emitted,
            duplicate_deltas,
            lost_writes,
            commit_conflicts,
            admissions,
            upstream_requests,
            upstream_request_duration,
            chat_request_duration,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the final outcome of a turn session
    pub fn record_turn(&self, outcome: &str, seconds: f64) {
        self.turns.with_label_values(&[outcome]).inc();
        self.turn_duration.observe(seconds);
    }

    /// Record a quota gate decision
    pub fn record_admission(&self, allowed: bool) {
        let decision = if allowed { "allowed" } else { "denied" };
        self.admissions.with_label_values(&[decision]).inc();
    }

    /// Record an upstream request outcome
    pub fn record_upstream(&self, operation: &str, status: &str) {
        self.upstream_requests
            .with_label_values(&[operation, status])
            .inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Helper macro to time operations
#[macro_export]
macro_rules! time_operation {
    ($histogram:expr, $label:expr, $operation:expr) => {{
        let timer = $histogram.with_label_values(&[$label]).start_timer();
        let result = $operation;
        timer.observe_duration();
        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_record_turn_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_turn("completed", 1.2);
        metrics.record_turn("failed", 0.1);

        assert_eq!(metrics.turns.with_label_values(&["completed"]).get(), 1.0);
        assert_eq!(metrics.turns.with_label_values(&["failed"]).get(), 1.0);
    }

    #[test]
    fn test_export_contains_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_admission(false);
        metrics.record_upstream("stream_run", "success");

        let text = metrics.export_prometheus();
        assert!(text.contains("admissions_total"));
        assert!(text.contains("upstream_requests_total"));
    }

    #[test]
    fn test_time_operation_macro() {
        let metrics = Metrics::new().unwrap();
        let value = crate::time_operation!(metrics.chat_request_duration, "fetch", 40 + 2);
        assert_eq!(value, 42);
    }
}
