//! Mesh client error types.

use signal_protocol::ProtocolError;
use thiserror::Error;

/// Mesh client error type.
///
/// `Clone` so one failure can be fanned out to every transport listener and
/// stored as a peer's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Caller identity was missing or rejected by the signal store.
    #[error("Authentication required")]
    AuthRequired,

    /// Caller is not a live member of the room.
    #[error("Not an active member of room {0}")]
    NotActiveMember(String),

    /// Offer/answer/candidate body is malformed.
    #[error("Invalid signal payload: {0}")]
    InvalidSignalPayload(String),

    /// Signal addressed to the local peer. Raised before any network call.
    #[error("Signal addressed to sender")]
    SelfAddressedSignal,

    /// No remote media arrived within the per-attempt timeout.
    #[error("Connection attempt timed out after {0} ms")]
    ConnectionTimeout(u64),

    /// Peer connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Signal transport lost its connection; it reconnects on its own.
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    /// Signal transport gave up after exhausting its reconnect budget.
    #[error("Transport exhausted after {0} reconnect attempts")]
    TransportExhausted(u32),

    /// Local capture is missing or could not be acquired.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Signal store request failed (network error or unexpected status).
    #[error("Signal store request failed: {0}")]
    Http(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel closed, task join failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// True for failures that end a state machine or subscription for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MeshError::ConnectionFailed(_) | MeshError::TransportExhausted(_)
        )
    }

    /// Map a signal store `{"error": {"code", "message"}}` body to a client error.
    #[must_use]
    pub fn from_store_error(code: &str, message: &str) -> Self {
        match code {
            "AUTH_REQUIRED" => MeshError::AuthRequired,
            "NOT_ACTIVE_MEMBER" => MeshError::NotActiveMember(message.to_string()),
            "INVALID_SIGNAL_PAYLOAD" => MeshError::InvalidSignalPayload(message.to_string()),
            "SELF_ADDRESSED_SIGNAL" => MeshError::SelfAddressedSignal,
            _ => MeshError::Http(format!("{code}: {message}")),
        }
    }
}

impl From<ProtocolError> for MeshError {
    fn from(err: ProtocolError) -> Self {
        MeshError::InvalidSignalPayload(err.to_string())
    }
}
