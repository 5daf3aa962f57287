//! Observability for the Signal Service.
//!
//! - [`metrics`] - Prometheus metric definitions and recorder setup
//! - [`health`] - liveness/readiness state and router

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
