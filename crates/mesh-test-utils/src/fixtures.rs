//! Pre-configured test data and an in-process signal store.

use crate::in_process::{InProcessSignalApi, InProcessStreamConnector};
use crate::mock_media::MockMediaDevices;
use crate::mock_peer::MockPeerConnector;
use crate::scripted::ChannelTransport;
use mesh_client::api::SignalApi;
use mesh_client::orchestrator::{
    ConnectionState, OrchestratorEvent, OrchestratorParts, OrchestratorSettings,
};
use mesh_client::transport::{BackoffPolicy, PullConfig, PushStreamTransport, WatermarkPullTransport};
use signal_protocol::{
    IceCandidate, PeerId, RoomId, SessionDescription, SignalId, SignalPayload, SignalingMessage,
    TrackState,
};
use signal_service::clock::ManualClock;
use signal_service::hub::SignalHub;
use signal_service::presence::InMemoryPresence;
use signal_service::store::{MemorySignalRepository, SignalService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Room used throughout the tests.
pub const TEST_ROOM: &str = "ABC123";

/// Store clock start, epoch milliseconds.
pub const TEST_EPOCH_MS: i64 = 1_700_000_000_000;

pub const TEST_SIGNAL_TTL_MS: i64 = 60_000;
pub const TEST_PRESENCE_WINDOW_MS: i64 = 30_000;

/// Upper bound for [`wait_for_event`] and [`eventually`]. Generous because
/// paused-clock tests auto-advance through it.
pub const WAIT_LIMIT: Duration = Duration::from_secs(120);

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id).expect("valid peer id")
}

pub fn room(id: &str) -> RoomId {
    RoomId::new(id).expect("valid room id")
}

pub fn offer(sdp: &str) -> SignalPayload {
    SignalPayload::Offer(SessionDescription {
        sdp: sdp.to_string(),
    })
}

pub fn answer(sdp: &str) -> SignalPayload {
    SignalPayload::Answer(SessionDescription {
        sdp: sdp.to_string(),
    })
}

pub fn candidate(candidate: &str) -> SignalPayload {
    SignalPayload::IceCandidate(IceCandidate {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    })
}

pub fn track_state(video_enabled: bool, audio_enabled: bool) -> SignalPayload {
    SignalPayload::TrackState(TrackState {
        video_enabled,
        audio_enabled,
    })
}

/// A stored-looking signal in [`TEST_ROOM`].
pub fn signal(from: &str, to: Option<&str>, payload: SignalPayload) -> SignalingMessage {
    SignalingMessage {
        id: SignalId::new(),
        room_id: room(TEST_ROOM),
        from_peer_id: peer(from),
        to_peer_id: to.map(peer),
        message: payload,
        created_at: TEST_EPOCH_MS,
    }
}

/// In-memory signal store on a manual clock.
///
/// Presence never lapses unless the test advances `clock` past the window.
pub struct TestSignalStore {
    pub service: SignalService,
    pub clock: Arc<ManualClock>,
    pub repository: Arc<MemorySignalRepository>,
}

impl TestSignalStore {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let repository = Arc::new(MemorySignalRepository::new());
        let presence = Arc::new(InMemoryPresence::new(clock.clone(), TEST_PRESENCE_WINDOW_MS));
        let service = SignalService::new(
            repository.clone(),
            presence,
            SignalHub::new(1024),
            clock.clone(),
            TEST_SIGNAL_TTL_MS,
        );
        Self {
            service,
            clock,
            repository,
        }
    }

    /// Heartbeat `peer_id` into `room_id` and return its client.
    pub async fn join(&self, room_id: &str, peer_id: &str) -> Arc<InProcessSignalApi> {
        let api = self.api(peer_id);
        api.heartbeat(&room(room_id)).await;
        api
    }

    /// Client for `peer_id` without touching presence.
    pub fn api(&self, peer_id: &str) -> Arc<InProcessSignalApi> {
        Arc::new(InProcessSignalApi::new(self.service.clone(), peer(peer_id)))
    }

    pub fn stream_connector(&self) -> Arc<InProcessStreamConnector> {
        Arc::new(InProcessStreamConnector::new(self.service.clone()))
    }

    /// Everything `peer_id` can read in `room_id`. The peer must be live.
    pub async fn inbox(&self, room_id: &str, peer_id: &str) -> Vec<SignalingMessage> {
        self.api(peer_id)
            .list_signals(&room(room_id), 0)
            .await
            .expect("inbox listing failed")
    }

    pub async fn stored_count(&self) -> usize {
        self.repository.len().await
    }
}

impl Default for TestSignalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull settings fast enough for real-time tests.
pub fn fast_pull_config() -> PullConfig {
    PullConfig {
        poll_interval: Duration::from_millis(20),
        ..PullConfig::default()
    }
}

/// Orchestrator over the store with watermark pull delivery.
pub fn orchestrator_parts(
    room_id: &str,
    api: Arc<InProcessSignalApi>,
    connector: Arc<MockPeerConnector>,
    devices: Arc<MockMediaDevices>,
) -> OrchestratorParts {
    OrchestratorParts {
        room: room(room_id),
        api: api.clone(),
        transport: Arc::new(WatermarkPullTransport::new(api, fast_pull_config())),
        connector,
        devices,
        settings: OrchestratorSettings::default(),
    }
}

/// Orchestrator over the store with push stream delivery.
pub fn push_orchestrator_parts(
    store: &TestSignalStore,
    room_id: &str,
    api: Arc<InProcessSignalApi>,
    connector: Arc<MockPeerConnector>,
    devices: Arc<MockMediaDevices>,
) -> OrchestratorParts {
    OrchestratorParts {
        room: room(room_id),
        api,
        transport: Arc::new(PushStreamTransport::new(
            store.stream_connector(),
            BackoffPolicy::default(),
            500,
        )),
        connector,
        devices,
        settings: OrchestratorSettings::default(),
    }
}

/// Orchestrator whose signals are fed by hand through `transport`.
pub fn scripted_parts(
    api: Arc<InProcessSignalApi>,
    transport: Arc<ChannelTransport>,
    connector: Arc<MockPeerConnector>,
    devices: Arc<MockMediaDevices>,
) -> OrchestratorParts {
    OrchestratorParts {
        room: room(TEST_ROOM),
        api,
        transport,
        connector,
        devices,
        settings: OrchestratorSettings::default(),
    }
}

/// Next event matching `matches`, skipping the rest.
///
/// # Panics
///
/// If nothing matches within [`WAIT_LIMIT`] or the channel closes.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    mut matches: F,
) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for orchestrator event")
}

/// Wait until `remote` enters `state`.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    remote: &str,
    state: ConnectionState,
) {
    let remote = peer(remote);
    wait_for_event(events, |event| {
        matches!(
            event,
            OrchestratorEvent::PeerStateChanged { peer, state: s } if *peer == remote && *s == state
        )
    })
    .await;
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// If it does not hold within [`WAIT_LIMIT`].
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
