//! HTTP routes for the Signal Service.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::store::SignalService;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: SignalService,
}

/// Build the signal API routes.
///
/// - `POST /v1/rooms/{room}/signals` - store a signal
/// - `GET /v1/rooms/{room}/signals?since=<ms>` - incremental read
/// - `GET /v1/rooms/{room}/stream` - WebSocket push stream
/// - `POST /v1/rooms/{room}/heartbeat` - presence heartbeat
///
/// Wrapped in a `TraceLayer` and a 30 second request timeout.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/rooms/:room/signals",
            post(handlers::send_signal).get(handlers::list_signals),
        )
        .route("/v1/rooms/:room/stream", get(handlers::stream_signals))
        .route("/v1/rooms/:room/heartbeat", post(handlers::heartbeat))
        .with_state(state)
        // Layer order (bottom-to-top execution):
        // 1. TimeoutLayer - Timeout the request (innermost)
        // 2. TraceLayer - Log request details
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
