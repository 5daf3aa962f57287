//! Signaling protocol for Tabletop Mesh.
//!
//! Shared between the signal store service and the mesh client:
//!
//! - [`ids`] - validated room/peer identifiers and server-assigned signal ids
//! - [`message`] - stored signaling records and their kind-specific payloads
//! - [`envelope`] - the versioned JSON envelope used on the push stream

#![warn(clippy::pedantic)]

pub mod envelope;
pub mod ids;
pub mod message;

pub use envelope::{decode_envelope, encode_envelope, SignalEnvelope, ENVELOPE_VERSION};
pub use ids::{PeerId, RoomId, SignalId};
pub use message::{
    IceCandidate, SessionDescription, SignalKind, SignalPayload, SignalingMessage, TrackState,
};

/// Error type for protocol operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Identifier failed validation.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Payload is structurally valid JSON but semantically malformed.
    #[error("Invalid signal payload: {0}")]
    InvalidPayload(String),

    /// Envelope version is not understood.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u32),

    /// Envelope type/event do not describe a signaling message.
    #[error("Unexpected envelope: {0}")]
    UnexpectedEnvelope(String),

    /// JSON could not be parsed.
    #[error("Malformed JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}
