//! Stored signaling records and kind-specific payloads.

use crate::ids::{PeerId, RoomId, SignalId};
use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session description carried by offers and answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Enablement of a peer's outbound tracks.
///
/// Disabled means muted: the track stays allocated, only its active flag changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackState {
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl Default for TrackState {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
        }
    }
}

/// Signal body. Serialized as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    TrackState(TrackState),
}

/// Discriminant of a [`SignalPayload`], used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    TrackState,
}

impl SignalKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::TrackState => "track-state",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalPayload {
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::TrackState(_) => SignalKind::TrackState,
        }
    }

    /// Check the payload is semantically usable by a peer connection.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidPayload` for an empty SDP, an empty candidate,
    /// or a candidate with neither `sdpMid` nor `sdpMLineIndex`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                if desc.sdp.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "{} has empty sdp",
                        self.kind()
                    )));
                }
            }
            SignalPayload::IceCandidate(candidate) => {
                if candidate.candidate.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload(
                        "ice-candidate has empty candidate".to_string(),
                    ));
                }
                if candidate.sdp_mid.is_none() && candidate.sdp_m_line_index.is_none() {
                    return Err(ProtocolError::InvalidPayload(
                        "ice-candidate requires sdpMid or sdpMLineIndex".to_string(),
                    ));
                }
            }
            SignalPayload::TrackState(_) => {}
        }
        Ok(())
    }
}

/// An immutable stored signal.
///
/// `to_peer_id = None` addresses every room member except the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub id: SignalId,
    pub room_id: RoomId,
    pub from_peer_id: PeerId,
    pub to_peer_id: Option<PeerId>,
    pub message: SignalPayload,
    /// Server-assigned creation time, epoch milliseconds.
    pub created_at: i64,
}

impl SignalingMessage {
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.message.kind()
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to_peer_id.is_none()
    }

    /// Addressing rule: direct to `peer` or broadcast, and never authored by `peer`.
    #[must_use]
    pub fn is_visible_to(&self, peer: &PeerId) -> bool {
        if &self.from_peer_id == peer {
            return false;
        }
        match &self.to_peer_id {
            Some(to) => to == peer,
            None => true,
        }
    }
}
