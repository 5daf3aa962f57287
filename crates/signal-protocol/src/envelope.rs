//! Versioned JSON envelope for signals pushed over a live stream.
//!
//! ```json
//! { "v": 1, "ts": 1700000000000,
//!   "type": "webrtc-signaling", "event": "signaling-message",
//!   "data": { "from": "A", "roomId": "ABC123", "id": "...", "to": "B",
//!             "message": { "type": "offer", "payload": { "sdp": "..." } } } }
//! ```
//!
//! `ts` carries the stored `createdAt`. `id` and `to` let receivers dedup and
//! re-check addressing.

use crate::ids::{PeerId, RoomId, SignalId};
use crate::message::{SignalPayload, SignalingMessage};
use crate::ProtocolError;
use serde::{Deserialize, Serialize};

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Envelope `type` for signaling traffic.
pub const ENVELOPE_TYPE: &str = "webrtc-signaling";

/// Envelope `event` for a single signaling message.
pub const ENVELOPE_EVENT: &str = "signaling-message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub v: u32,
    pub ts: i64,
    #[serde(rename = "type")]
    pub envelope_type: String,
    pub event: String,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub from: PeerId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SignalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub message: SignalPayload,
}

impl From<&SignalingMessage> for SignalEnvelope {
    fn from(msg: &SignalingMessage) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ts: msg.created_at,
            envelope_type: ENVELOPE_TYPE.to_string(),
            event: ENVELOPE_EVENT.to_string(),
            data: EnvelopeData {
                from: msg.from_peer_id.clone(),
                room_id: msg.room_id.clone(),
                id: Some(msg.id),
                to: msg.to_peer_id.clone(),
                message: msg.message.clone(),
            },
        }
    }
}

impl TryFrom<SignalEnvelope> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(envelope: SignalEnvelope) -> Result<Self, Self::Error> {
        if envelope.v != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.v));
        }
        if envelope.envelope_type != ENVELOPE_TYPE || envelope.event != ENVELOPE_EVENT {
            return Err(ProtocolError::UnexpectedEnvelope(format!(
                "{}/{}",
                envelope.envelope_type, envelope.event
            )));
        }
        let id = envelope
            .data
            .id
            .ok_or_else(|| ProtocolError::UnexpectedEnvelope("missing data.id".to_string()))?;

        Ok(SignalingMessage {
            id,
            room_id: envelope.data.room_id,
            from_peer_id: envelope.data.from,
            to_peer_id: envelope.data.to,
            message: envelope.data.message,
            created_at: envelope.ts,
        })
    }
}

/// Encode a stored signal as an envelope JSON string.
///
/// # Errors
///
/// Returns `ProtocolError::Json` if serialization fails.
pub fn encode_envelope(msg: &SignalingMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&SignalEnvelope::from(msg))?)
}

/// Decode an envelope JSON string into a signal.
///
/// # Errors
///
/// Returns an error for malformed JSON, a version other than 1, a non-signaling
/// `type`/`event`, or a missing `data.id`.
pub fn decode_envelope(text: &str) -> Result<SignalingMessage, ProtocolError> {
    let envelope: SignalEnvelope = serde_json::from_str(text)?;
    SignalingMessage::try_from(envelope)
}
