//! Scriptable peer connector.
//!
//! Every `create_link` call is recorded with the (tokio) time it happened,
//! which is what reconnect timing tests assert on. Tests drive a link by
//! emitting [`LinkEvent`]s through its recorded sink.

use async_trait::async_trait;
use mesh_client::media::{LocalStream, TrackRef};
use mesh_client::orchestrator::{LinkEvent, LinkEvents, PeerConnector, PeerLink};
use mesh_client::MeshError;
use signal_protocol::{IceCandidate, PeerId, SessionDescription};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Calls made on one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkLog {
    pub offers_created: usize,
    /// SDP of every remote offer accepted.
    pub offers_accepted: Vec<String>,
    /// SDP of every remote answer applied.
    pub answers_applied: Vec<String>,
    pub candidates: Vec<String>,
    /// Track ids passed to `replace_video_track`.
    pub replaced_video: Vec<String>,
    pub closed: bool,
    /// Whether local media was attached at creation.
    pub had_local_media: bool,
}

/// A link handed out by [`MockPeerConnector`].
#[derive(Debug, Clone)]
pub struct MockLinkRecord {
    pub remote: PeerId,
    pub events: LinkEvents,
    log: Arc<Mutex<LinkLog>>,
}

impl MockLinkRecord {
    pub fn log(&self) -> LinkLog {
        self.log.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.events.emit(event)
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    links: Vec<MockLinkRecord>,
    attempts: HashMap<PeerId, Vec<Instant>>,
    refuse: HashSet<PeerId>,
    fail_close: HashSet<PeerId>,
    fail_replace: HashSet<PeerId>,
}

/// [`PeerConnector`] that records calls and fails on request.
#[derive(Debug, Default)]
pub struct MockPeerConnector {
    state: Arc<Mutex<ConnectorState>>,
}

fn peer(id: &str) -> PeerId {
    PeerId::new(id).expect("valid peer id")
}

impl MockPeerConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `create_link` toward `remote` fail until [`recover_peer`](Self::recover_peer).
    pub fn fail_peer(&self, remote: &str) {
        self.state.lock().unwrap().refuse.insert(peer(remote));
    }

    pub fn recover_peer(&self, remote: &str) {
        self.state.lock().unwrap().refuse.remove(&peer(remote));
    }

    /// Make `close` on links to `remote` return an error (the link is still
    /// marked closed).
    pub fn fail_close_for(&self, remote: &str) {
        self.state.lock().unwrap().fail_close.insert(peer(remote));
    }

    pub fn fail_replace_for(&self, remote: &str) {
        self.state.lock().unwrap().fail_replace.insert(peer(remote));
    }

    /// When each `create_link` toward `remote` was called, including refused ones.
    pub fn attempts_for(&self, remote: &str) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(&peer(remote))
            .cloned()
            .unwrap_or_default()
    }

    /// Links created toward `remote`, oldest first.
    pub fn links_for(&self, remote: &str) -> Vec<MockLinkRecord> {
        let remote = peer(remote);
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.remote == remote)
            .cloned()
            .collect()
    }

    pub fn latest_link(&self, remote: &str) -> Option<MockLinkRecord> {
        self.links_for(remote).pop()
    }

    /// Emit `event` on the newest link toward `remote`.
    ///
    /// # Panics
    ///
    /// If no link toward `remote` exists.
    pub fn emit(&self, remote: &str, event: LinkEvent) -> bool {
        self.latest_link(remote)
            .unwrap_or_else(|| panic!("no link toward {remote}"))
            .emit(event)
    }

    pub fn total_links(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }
}

#[async_trait]
impl PeerConnector for MockPeerConnector {
    async fn create_link(
        &self,
        remote: &PeerId,
        local_media: Option<&LocalStream>,
        events: LinkEvents,
    ) -> Result<Box<dyn PeerLink>, MeshError> {
        let mut state = self.state.lock().unwrap();
        state
            .attempts
            .entry(remote.clone())
            .or_default()
            .push(Instant::now());
        if state.refuse.contains(remote) {
            return Err(MeshError::ConnectionFailed(format!(
                "mock connector refused {remote}"
            )));
        }

        let log = Arc::new(Mutex::new(LinkLog {
            had_local_media: local_media.is_some(),
            ..LinkLog::default()
        }));
        state.links.push(MockLinkRecord {
            remote: remote.clone(),
            events,
            log: Arc::clone(&log),
        });

        Ok(Box::new(MockLink {
            remote: remote.clone(),
            log,
            connector: Arc::clone(&self.state),
        }))
    }
}

struct MockLink {
    remote: PeerId,
    log: Arc<Mutex<LinkLog>>,
    connector: Arc<Mutex<ConnectorState>>,
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError> {
        let mut log = self.log.lock().unwrap();
        log.offers_created += 1;
        Ok(SessionDescription {
            sdp: format!("v=0 offer-to-{} #{}", self.remote, log.offers_created),
        })
    }

    async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MeshError> {
        self.log.lock().unwrap().offers_accepted.push(offer.sdp.clone());
        Ok(SessionDescription {
            sdp: format!("v=0 answer-to-{}", self.remote),
        })
    }

    async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), MeshError> {
        self.log.lock().unwrap().answers_applied.push(answer.sdp.clone());
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MeshError> {
        self.log
            .lock()
            .unwrap()
            .candidates
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&mut self, track: &TrackRef) -> Result<(), MeshError> {
        if self.connector.lock().unwrap().fail_replace.contains(&self.remote) {
            return Err(MeshError::MediaUnavailable(format!(
                "mock replace failed for {}",
                self.remote
            )));
        }
        self.log
            .lock()
            .unwrap()
            .replaced_video
            .push(track.id().to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MeshError> {
        self.log.lock().unwrap().closed = true;
        if self.connector.lock().unwrap().fail_close.contains(&self.remote) {
            return Err(MeshError::Internal(format!(
                "mock close failed for {}",
                self.remote
            )));
        }
        Ok(())
    }
}
