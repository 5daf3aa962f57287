//! Room presence.
//!
//! Membership bookkeeping belongs to the surrounding product; the signal
//! store only needs to ask whether a peer is a live member right now. A
//! member is live when its last heartbeat falls within the presence window.

use crate::clock::Clock;
use crate::errors::SignalError;
use async_trait::async_trait;
use signal_protocol::{PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Presence directory seam.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Whether `peer` is a live member of `room`.
    async fn is_live_member(&self, room: &RoomId, peer: &PeerId) -> Result<bool, SignalError>;

    /// Record a heartbeat for `peer` in `room`.
    async fn record_heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SignalError>;

    /// Drop `peer` from `room` immediately.
    async fn remove_member(&self, room: &RoomId, peer: &PeerId) -> Result<(), SignalError>;
}

/// Heartbeat-based presence held in process memory.
pub struct InMemoryPresence {
    clock: Arc<dyn Clock>,
    window_ms: i64,
    heartbeats: RwLock<HashMap<RoomId, HashMap<PeerId, i64>>>,
}

impl InMemoryPresence {
    pub fn new(clock: Arc<dyn Clock>, window_ms: i64) -> Self {
        Self {
            clock,
            window_ms,
            heartbeats: RwLock::new(HashMap::new()),
        }
    }

    /// Live members of `room`, sorted by peer id.
    pub async fn live_members(&self, room: &RoomId) -> Vec<PeerId> {
        let now = self.clock.now_ms();
        let heartbeats = self.heartbeats.read().await;
        let mut members: Vec<PeerId> = heartbeats
            .get(room)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(_, last)| now - **last <= self.window_ms)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }
}

#[async_trait]
impl PresenceDirectory for InMemoryPresence {
    async fn is_live_member(&self, room: &RoomId, peer: &PeerId) -> Result<bool, SignalError> {
        let now = self.clock.now_ms();
        let heartbeats = self.heartbeats.read().await;
        Ok(heartbeats
            .get(room)
            .and_then(|peers| peers.get(peer))
            .is_some_and(|last| now - *last <= self.window_ms))
    }

    async fn record_heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SignalError> {
        let now = self.clock.now_ms();
        let mut heartbeats = self.heartbeats.write().await;
        heartbeats
            .entry(room.clone())
            .or_default()
            .insert(peer.clone(), now);
        Ok(())
    }

    async fn remove_member(&self, room: &RoomId, peer: &PeerId) -> Result<(), SignalError> {
        let mut heartbeats = self.heartbeats.write().await;
        if let Some(peers) = heartbeats.get_mut(room) {
            peers.remove(peer);
            if peers.is_empty() {
                heartbeats.remove(room);
            }
        }
        Ok(())
    }
}
