//! Metrics definitions for the Signal Service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `signal_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `kind`: 4 values (offer, answer, ice-candidate, track-state)
//! - `reason`: bounded by `SignalError::error_code` (~6 values)
//! - `operation`: bounded by repository operations (4 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store latency buckets - in-memory or Redis round trip
        .set_buckets_for_metric(
            Matcher::Prefix("signal_store".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record an accepted signal.
///
/// Metric: `signal_sent_total`
/// Labels: `kind`
pub fn record_signal_sent(kind: &str) {
    counter!("signal_sent_total", "kind" => kind.to_string()).increment(1);
}

/// Record a rejected send or list call.
///
/// Metric: `signal_rejected_total`
/// Labels: `reason` (error code)
pub fn record_signal_rejected(reason: &str) {
    counter!("signal_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record signals returned by a list call.
///
/// Metric: `signal_listed_total`
pub fn record_signals_listed(count: usize) {
    counter!("signal_listed_total").increment(count as u64);
}

/// Record signals removed by an expiry sweep.
///
/// Metric: `signal_expired_total`
pub fn record_signals_expired(count: u64) {
    counter!("signal_expired_total").increment(count);
}

/// Record repository operation latency.
///
/// Metric: `signal_store_latency_seconds`
/// Labels: `operation` (append, range, delete_expired, ping)
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!("signal_store_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Track an opened push stream.
///
/// Metric: `signal_stream_subscribers`
pub fn stream_opened() {
    gauge!("signal_stream_subscribers").increment(1.0);
}

/// Track a closed push stream.
///
/// Metric: `signal_stream_subscribers`
pub fn stream_closed() {
    gauge!("signal_stream_subscribers").decrement(1.0);
}
