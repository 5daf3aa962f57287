//! Observability for the mesh client.
//!
//! The client only emits through the `metrics` facade; the host process
//! decides which recorder to install.

pub mod metrics;
