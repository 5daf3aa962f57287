//! Signal store.
//!
//! [`SignalService`] is the only entry point: it checks the caller, the
//! addressing and room membership before touching storage, and it turns
//! `list` into two targeted range reads (the caller's direct mailbox and the
//! room broadcast mailbox) so read cost never depends on total room traffic.
//!
//! Records are immutable once appended and are only removed by [`SignalService::expire`].

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::MemorySignalRepository;
pub use self::redis::RedisSignalRepository;

use crate::clock::Clock;
use crate::errors::SignalError;
use crate::hub::SignalHub;
use crate::observability::metrics;
use crate::presence::PresenceDirectory;
use async_trait::async_trait;
use signal_protocol::{PeerId, RoomId, SignalId, SignalPayload, SignalingMessage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// A record as held by a repository.
///
/// `seq` is assigned on append and increases across every mailbox of the
/// repository, so records created in the same millisecond keep append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSignal {
    pub seq: u64,
    pub message: SignalingMessage,
}

/// Storage seam for signaling records.
///
/// Implementations keep one mailbox per direct recipient and one per room
/// broadcast, each ordered by `(createdAt, seq)`.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// Append an immutable record. Returns the assigned sequence number.
    async fn append(&self, message: &SignalingMessage) -> Result<u64, SignalError>;

    /// Records addressed to `to` in `room` with `createdAt > since`, ascending.
    async fn range_direct(
        &self,
        room: &RoomId,
        to: &PeerId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError>;

    /// Broadcast records in `room` with `createdAt > since`, ascending.
    async fn range_broadcast(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<StoredSignal>, SignalError>;

    /// Delete every record with `createdAt < cutoff`. Returns the number removed.
    async fn delete_older_than(&self, cutoff: i64) -> Result<u64, SignalError>;

    /// Round trip to the backend.
    async fn ping(&self) -> Result<(), SignalError>;
}

/// Signal store facade: auth, addressing and membership rules over a repository.
#[derive(Clone)]
pub struct SignalService {
    repository: Arc<dyn SignalRepository>,
    presence: Arc<dyn PresenceDirectory>,
    hub: SignalHub,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
}

impl SignalService {
    pub fn new(
        repository: Arc<dyn SignalRepository>,
        presence: Arc<dyn PresenceDirectory>,
        hub: SignalHub,
        clock: Arc<dyn Clock>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            repository,
            presence,
            hub,
            clock,
            ttl_ms,
        }
    }

    #[must_use]
    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    #[must_use]
    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Store a signal from `caller` and publish it to open streams.
    ///
    /// Checks run in order: caller present, not self-addressed, payload valid,
    /// caller is a live member. Nothing is written unless all pass.
    ///
    /// # Errors
    ///
    /// `AuthRequired`, `SelfAddressedSignal`, `InvalidSignalPayload`,
    /// `NotActiveMember`, or a storage error.
    #[instrument(skip_all, name = "signal.store.send", fields(room_id = %room, kind = %payload.kind()))]
    pub async fn send(
        &self,
        caller: Option<&PeerId>,
        room: &RoomId,
        to: Option<PeerId>,
        payload: SignalPayload,
    ) -> Result<SignalId, SignalError> {
        let result = self.send_checked(caller, room, to, payload).await;
        if let Err(e) = &result {
            metrics::record_signal_rejected(e.error_code());
        }
        result
    }

    async fn send_checked(
        &self,
        caller: Option<&PeerId>,
        room: &RoomId,
        to: Option<PeerId>,
        payload: SignalPayload,
    ) -> Result<SignalId, SignalError> {
        let from = caller.ok_or(SignalError::AuthRequired)?;
        if to.as_ref() == Some(from) {
            return Err(SignalError::SelfAddressedSignal);
        }
        payload.validate()?;
        self.require_live_member(room, from).await?;

        let message = SignalingMessage {
            id: SignalId::new(),
            room_id: room.clone(),
            from_peer_id: from.clone(),
            to_peer_id: to,
            message: payload,
            created_at: self.clock.now_ms(),
        };

        let start = Instant::now();
        let seq = self.repository.append(&message).await?;
        metrics::record_store_latency("append", start.elapsed());
        metrics::record_signal_sent(message.kind().as_str());

        debug!(
            target: "signal.store",
            signal_id = %message.id,
            seq = seq,
            from = %message.from_peer_id,
            to = ?message.to_peer_id.as_ref().map(PeerId::as_str),
            kind = %message.kind(),
            created_at = message.created_at,
            "Signal stored"
        );

        let id = message.id;
        self.hub.publish(Arc::new(message));
        Ok(id)
    }

    /// Signals visible to `caller` in `room` created after `since`, ascending
    /// by `createdAt` and in append order within a millisecond.
    ///
    /// # Errors
    ///
    /// `AuthRequired`, `NotActiveMember`, or a storage error.
    #[instrument(skip_all, name = "signal.store.list", fields(room_id = %room, since = since))]
    pub async fn list(
        &self,
        caller: Option<&PeerId>,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, SignalError> {
        let result = self.list_checked(caller, room, since).await;
        if let Err(e) = &result {
            metrics::record_signal_rejected(e.error_code());
        }
        result
    }

    async fn list_checked(
        &self,
        caller: Option<&PeerId>,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, SignalError> {
        let caller = caller.ok_or(SignalError::AuthRequired)?;
        self.require_live_member(room, caller).await?;

        let start = Instant::now();
        let (direct, broadcast) = tokio::try_join!(
            self.repository.range_direct(room, caller, since),
            self.repository.range_broadcast(room, since),
        )?;
        metrics::record_store_latency("range", start.elapsed());

        let expiry_floor = self.clock.now_ms() - self.ttl_ms;
        let mut stored: Vec<StoredSignal> = direct
            .into_iter()
            .chain(broadcast)
            .filter(|s| {
                let m = &s.message;
                &m.room_id == room
                    && m.is_visible_to(caller)
                    && m.created_at > since
                    && m.created_at >= expiry_floor
            })
            .collect();
        stored.sort_by_key(|s| (s.message.created_at, s.seq));
        let messages: Vec<SignalingMessage> = stored.into_iter().map(|s| s.message).collect();

        metrics::record_signals_listed(messages.len());
        Ok(messages)
    }

    /// Delete every signal older than the TTL. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the sweep fails.
    #[instrument(skip_all, name = "signal.store.expire")]
    pub async fn expire(&self) -> Result<u64, SignalError> {
        let cutoff = self.clock.now_ms() - self.ttl_ms;

        let start = Instant::now();
        let removed = self.repository.delete_older_than(cutoff).await?;
        metrics::record_store_latency("delete_expired", start.elapsed());
        metrics::record_signals_expired(removed);

        if removed > 0 {
            info!(target: "signal.store", removed = removed, cutoff = cutoff, "Expired signals");
        }
        Ok(removed)
    }

    /// Authorize a push stream for `caller` in `room` and subscribe to the hub.
    ///
    /// # Errors
    ///
    /// `AuthRequired` or `NotActiveMember`.
    pub async fn open_stream(
        &self,
        caller: Option<&PeerId>,
        room: &RoomId,
    ) -> Result<broadcast::Receiver<Arc<SignalingMessage>>, SignalError> {
        let caller = caller.ok_or(SignalError::AuthRequired)?;
        self.require_live_member(room, caller).await?;
        Ok(self.hub.subscribe())
    }

    /// Whether `peer` is still a live member of `room`. Open push streams
    /// re-check this before forwarding.
    ///
    /// # Errors
    ///
    /// A presence backend error.
    pub async fn is_live_member(&self, room: &RoomId, peer: &PeerId) -> Result<bool, SignalError> {
        self.presence.is_live_member(room, peer).await
    }

    /// Check that the storage backend answers.
    ///
    /// # Errors
    ///
    /// The backend error if it does not.
    pub async fn ping(&self) -> Result<(), SignalError> {
        let start = Instant::now();
        let result = self.repository.ping().await;
        metrics::record_store_latency("ping", start.elapsed());
        result
    }

    /// Record a presence heartbeat for `caller`.
    ///
    /// # Errors
    ///
    /// `AuthRequired` or a presence backend error.
    pub async fn heartbeat(&self, caller: Option<&PeerId>, room: &RoomId) -> Result<(), SignalError> {
        let caller = caller.ok_or(SignalError::AuthRequired)?;
        self.presence.record_heartbeat(room, caller).await
    }

    async fn require_live_member(&self, room: &RoomId, peer: &PeerId) -> Result<(), SignalError> {
        if self.presence.is_live_member(room, peer).await? {
            Ok(())
        } else {
            warn!(target: "signal.store", room_id = %room, peer_id = %peer, "Caller is not a live member");
            Err(SignalError::NotActiveMember(room.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::InMemoryPresence;
    use signal_protocol::{IceCandidate, SessionDescription, TrackState};

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        service: SignalService,
        repository: Arc<MemorySignalRepository>,
        presence: Arc<InMemoryPresence>,
        clock: Arc<ManualClock>,
        room: RoomId,
    }

    fn peer(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    async fn fixture(members: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let repository = Arc::new(MemorySignalRepository::new());
        // Wide window so members stay live across TTL scenarios.
        let presence = Arc::new(InMemoryPresence::new(clock.clone(), 10 * 60_000));
        let room = RoomId::new("ABC123").unwrap();
        for m in members {
            presence.record_heartbeat(&room, &peer(m)).await.unwrap();
        }
        let service = SignalService::new(
            repository.clone(),
            presence.clone(),
            SignalHub::new(16),
            clock.clone(),
            60_000,
        );
        Fixture {
            service,
            repository,
            presence,
            clock,
            room,
        }
    }

    fn offer() -> SignalPayload {
        SignalPayload::Offer(SessionDescription {
            sdp: "v=0".to_string(),
        })
    }

    fn candidate() -> SignalPayload {
        SignalPayload::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        })
    }

    #[tokio::test]
    async fn test_direct_offer_seen_only_by_target() {
        let f = fixture(&["A", "B", "C"]).await;
        f.service
            .send(Some(&peer("A")), &f.room, Some(peer("B")), offer())
            .await
            .unwrap();

        let for_b = f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].from_peer_id.as_str(), "A");
        assert_eq!(for_b[0].kind().as_str(), "offer");

        assert!(f.service.list(Some(&peer("A")), &f.room, 0).await.unwrap().is_empty());
        assert!(f.service.list(Some(&peer("C")), &f.room, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_seen_by_everyone_but_sender() {
        let f = fixture(&["A", "B", "C"]).await;
        f.service
            .send(
                Some(&peer("A")),
                &f.room,
                None,
                SignalPayload::TrackState(TrackState {
                    video_enabled: false,
                    audio_enabled: true,
                }),
            )
            .await
            .unwrap();

        assert_eq!(f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap().len(), 1);
        assert_eq!(f.service.list(Some(&peer("C")), &f.room, 0).await.unwrap().len(), 1);
        assert!(f.service.list(Some(&peer("A")), &f.room, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_addressed_candidate_rejected_without_write() {
        let f = fixture(&["A"]).await;
        let result = f
            .service
            .send(Some(&peer("A")), &f.room, Some(peer("A")), candidate())
            .await;
        assert!(matches!(result, Err(SignalError::SelfAddressedSignal)));
        assert_eq!(f.repository.len().await, 0);
    }

    #[tokio::test]
    async fn test_send_requires_caller() {
        let f = fixture(&["A"]).await;
        let result = f.service.send(None, &f.room, None, offer()).await;
        assert!(matches!(result, Err(SignalError::AuthRequired)));
        assert!(matches!(
            f.service.list(None, &f.room, 0).await,
            Err(SignalError::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn test_non_member_rejected() {
        let f = fixture(&["A"]).await;
        let result = f
            .service
            .send(Some(&peer("Z")), &f.room, Some(peer("A")), offer())
            .await;
        assert!(matches!(result, Err(SignalError::NotActiveMember(_))));
        assert!(matches!(
            f.service.list(Some(&peer("Z")), &f.room, 0).await,
            Err(SignalError::NotActiveMember(_))
        ));
        assert_eq!(f.repository.len().await, 0);
    }

    #[tokio::test]
    async fn test_stale_member_rejected() {
        let f = fixture(&[]).await;
        let short = Arc::new(InMemoryPresence::new(f.clock.clone(), 30_000));
        short.record_heartbeat(&f.room, &peer("A")).await.unwrap();
        let service = SignalService::new(
            f.repository.clone(),
            short,
            SignalHub::new(4),
            f.clock.clone(),
            60_000,
        );

        f.clock.advance_ms(31_000);
        let result = service.send(Some(&peer("A")), &f.room, None, offer()).await;
        assert!(matches!(result, Err(SignalError::NotActiveMember(_))));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let f = fixture(&["A", "B"]).await;
        let result = f
            .service
            .send(
                Some(&peer("A")),
                &f.room,
                Some(peer("B")),
                SignalPayload::Answer(SessionDescription { sdp: String::new() }),
            )
            .await;
        assert!(matches!(result, Err(SignalError::InvalidSignalPayload(_))));
        assert_eq!(f.repository.len().await, 0);
    }

    #[tokio::test]
    async fn test_list_respects_since_and_orders_ascending() {
        let f = fixture(&["A", "B"]).await;
        let a = peer("A");
        let first = f.service.send(Some(&a), &f.room, Some(peer("B")), offer()).await.unwrap();
        f.clock.advance_ms(10);
        let second = f.service.send(Some(&a), &f.room, None, candidate()).await.unwrap();
        f.clock.advance_ms(10);
        let third = f.service.send(Some(&a), &f.room, Some(peer("B")), candidate()).await.unwrap();

        let all = f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap();
        let ids: Vec<SignalId> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second, third]);

        let newer = f.service.list(Some(&peer("B")), &f.room, T0 + 10).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, third);
    }

    #[tokio::test]
    async fn test_same_millisecond_signals_keep_send_order() {
        let f = fixture(&["A", "B"]).await;
        let a = peer("A");
        let mut sent = Vec::new();
        for _ in 0..20 {
            sent.push(f.service.send(Some(&a), &f.room, Some(peer("B")), offer()).await.unwrap());
            sent.push(f.service.send(Some(&a), &f.room, None, candidate()).await.unwrap());
            sent.push(f.service.send(Some(&a), &f.room, Some(peer("B")), candidate()).await.unwrap());
        }

        let listed: Vec<SignalId> = f
            .service
            .list(Some(&peer("B")), &f.room, 0)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, sent);
    }

    #[tokio::test]
    async fn test_ttl_expiry_scenario() {
        let f = fixture(&["A", "B"]).await;
        f.service
            .send(Some(&peer("A")), &f.room, Some(peer("B")), offer())
            .await
            .unwrap();

        f.clock.advance_ms(59_000);
        assert_eq!(f.service.expire().await.unwrap(), 0);
        assert_eq!(f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap().len(), 1);

        f.clock.advance_ms(2_000);
        assert_eq!(f.service.expire().await.unwrap(), 1);
        assert!(f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap().is_empty());

        // Second sweep is a no-op.
        assert_eq!(f.service.expire().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_hides_expired_before_sweep() {
        let f = fixture(&["A", "B"]).await;
        f.service
            .send(Some(&peer("A")), &f.room, None, offer())
            .await
            .unwrap();
        f.clock.advance_ms(61_000);
        assert!(f.service.list(Some(&peer("B")), &f.room, 0).await.unwrap().is_empty());
        assert_eq!(f.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_send_publishes_to_hub() {
        let f = fixture(&["A", "B"]).await;
        let mut rx = f.service.open_stream(Some(&peer("B")), &f.room).await.unwrap();
        let id = f
            .service
            .send(Some(&peer("A")), &f.room, Some(peer("B")), offer())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_open_stream_requires_membership() {
        let f = fixture(&["A"]).await;
        assert!(matches!(
            f.service.open_stream(Some(&peer("B")), &f.room).await,
            Err(SignalError::NotActiveMember(_))
        ));
        f.service.heartbeat(Some(&peer("B")), &f.room).await.unwrap();
        assert!(f.presence.is_live_member(&f.room, &peer("B")).await.unwrap());
        assert!(f.service.open_stream(Some(&peer("B")), &f.room).await.is_ok());
    }
}
