//! HTTP handlers for the signal API.

pub mod signals;
pub mod stream;

pub use signals::{heartbeat, list_signals, send_signal};
pub use stream::stream_signals;

use crate::errors::SignalError;
use axum::http::HeaderMap;
use signal_protocol::{PeerId, RoomId};

/// Header carrying the authenticated caller, set by the upstream gateway.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// Resolve the authenticated caller.
///
/// # Errors
///
/// `AuthRequired` if the header is missing, not UTF-8, or not a valid peer id.
pub fn require_caller(headers: &HeaderMap) -> Result<PeerId, SignalError> {
    headers
        .get(PEER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| PeerId::new(value).ok())
        .ok_or(SignalError::AuthRequired)
}

/// Validate the `{room}` path segment.
///
/// # Errors
///
/// `InvalidRequest` if the segment is not a valid room id.
pub fn parse_room(raw: String) -> Result<RoomId, SignalError> {
    RoomId::new(raw).map_err(|e| SignalError::InvalidRequest(e.to_string()))
}
