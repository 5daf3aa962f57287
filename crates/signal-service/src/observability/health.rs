//! Health endpoints for the Signal Service.
//!
//! - `GET /health` - liveness; answers as long as the process is serving
//! - `GET /ready` - readiness; the signal store answers a ping and the
//!   service is not draining for shutdown
//!
//! `/metrics` is merged next to these in `main.rs`.

use crate::store::SignalService;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Shared state behind the health router.
pub struct HealthState {
    service: SignalService,
    draining: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new(service: SignalService) -> Self {
        Self {
            service,
            draining: AtomicBool::new(false),
        }
    }

    /// Stop reporting ready. Called once shutdown starts so the load
    /// balancer drops this instance before the listeners close.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Body of `GET /ready`.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler() -> &'static str {
    "OK"
}

/// Backend errors are logged here and never returned in the response body.
#[instrument(skip_all, name = "signal.health.readiness")]
async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    if state.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "draining",
                store: None,
                error: None,
            }),
        );
    }

    if let Err(e) = state.service.ping().await {
        warn!(target: "signal.health", error = %e, "Readiness check failed: signal store unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                store: Some("unhealthy"),
                error: Some("Service dependencies unavailable"),
            }),
        );
    }

    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status: "ready",
            store: Some("healthy"),
            error: None,
        }),
    )
}
