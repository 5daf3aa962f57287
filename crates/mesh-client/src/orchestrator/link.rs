//! Peer connection seam.
//!
//! The media engine (SDP negotiation, ICE, DTLS, RTP) lives behind
//! [`PeerConnector`] and [`PeerLink`]. The orchestrator owns every link and
//! drives it from a single task; links report back through [`LinkEvents`].

use crate::errors::MeshError;
use crate::media::{LocalStream, TrackRef};
use async_trait::async_trait;
use signal_protocol::{IceCandidate, PeerId, SessionDescription};
use tokio::sync::mpsc;

/// Something a link observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    /// First remote media arrived.
    RemoteMedia,
    /// The underlying channel closed.
    Closed,
    /// The connection failed.
    Failed(String),
}

/// A [`LinkEvent`] tagged with the attempt it belongs to.
#[derive(Debug)]
pub(crate) struct LinkNotice {
    pub(crate) peer: PeerId,
    pub(crate) generation: u64,
    pub(crate) event: LinkEvent,
}

/// Event sink handed to a link when it is created.
///
/// Events from a replaced or torn-down attempt are ignored by the
/// orchestrator, so a link may keep emitting after it was closed.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    peer: PeerId,
    generation: u64,
    sender: mpsc::UnboundedSender<LinkNotice>,
}

impl LinkEvents {
    pub(crate) fn new(
        peer: PeerId,
        generation: u64,
        sender: mpsc::UnboundedSender<LinkNotice>,
    ) -> Self {
        Self {
            peer,
            generation,
            sender,
        }
    }

    /// Remote peer this sink reports for.
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Report `event`. Returns `false` once the orchestrator has stopped.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.sender
            .send(LinkNotice {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a connection to `remote` carrying `local_media` (receive-only
    /// when `None`).
    async fn create_link(
        &self,
        remote: &PeerId,
        local_media: Option<&LocalStream>,
        events: LinkEvents,
    ) -> Result<Box<dyn PeerLink>, MeshError>;
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send {
    /// Produce a local offer.
    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MeshError>;

    /// Apply the remote answer to our offer.
    async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), MeshError>;

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MeshError>;

    /// Swap the outbound video track without renegotiating.
    async fn replace_video_track(&mut self, track: &TrackRef) -> Result<(), MeshError>;

    async fn close(&mut self) -> Result<(), MeshError>;
}
