//! Metrics definitions for the mesh client.
//!
//! All metrics use the `mesh_` prefix and the `_total` suffix for counters.
//!
//! # Cardinality
//!
//! - `kind`: 4 values (offer, answer, ice-candidate, track-state)
//! - `reason`: own, misaddressed, duplicate, malformed, stale
//! - `state`: 5 connection states plus `removed`

use metrics::counter;

/// Record a signal handed to transport listeners.
///
/// Metric: `mesh_signals_received_total`
/// Labels: `kind`
pub fn record_signal_received(kind: &str) {
    counter!("mesh_signals_received_total", "kind" => kind.to_string()).increment(1);
}

/// Record a signal dropped before reaching listeners.
///
/// Metric: `mesh_signals_dropped_total`
/// Labels: `reason`
pub fn record_signal_dropped(reason: &'static str) {
    counter!("mesh_signals_dropped_total", "reason" => reason).increment(1);
}

/// Record a per-peer state transition.
///
/// Metric: `mesh_peer_transitions_total`
/// Labels: `state` (the state entered)
pub fn record_peer_transition(state: &'static str) {
    counter!("mesh_peer_transitions_total", "state" => state).increment(1);
}

/// Record a push stream reconnect attempt.
///
/// Metric: `mesh_transport_reconnects_total`
pub fn record_transport_reconnect() {
    counter!("mesh_transport_reconnects_total").increment(1);
}
