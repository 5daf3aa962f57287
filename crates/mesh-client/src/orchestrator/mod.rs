//! Connection orchestration.
//!
//! Keeps one state machine per remote peer and reconciles the set of live
//! connections against room membership:
//!
//! - [`state`] - connection states and the reconnect schedule
//! - [`link`] - the peer connection seam (media engine lives elsewhere)
//! - [`actor`] - the orchestrator task and its handle

pub mod actor;
pub mod link;
pub mod state;

pub use actor::{
    OrchestratorActor, OrchestratorEvent, OrchestratorHandle, OrchestratorParts,
    OrchestratorSettings, ReconcileOutcome, TrackStates,
};
pub use link::{LinkEvent, LinkEvents, PeerConnector, PeerLink};
pub use state::{ConnectionState, PeerConnectionState, RetryPolicy};
