//! Integration tests for the connection orchestrator.
//!
//! Signals are fed by hand through a `ChannelTransport`; outgoing signals
//! land in an in-process signal store where the tests read them back.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use mesh_client::media::{CaptureConstraints, CaptureTrack, TrackKind};
use mesh_client::orchestrator::{
    ConnectionState, LinkEvent, OrchestratorActor, OrchestratorEvent, OrchestratorHandle,
    OrchestratorSettings, RetryPolicy,
};
use mesh_client::MeshError;
use mesh_test_utils::*;
use signal_protocol::{SignalKind, SignalPayload, SignalingMessage, TrackState};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    store: TestSignalStore,
    transport: Arc<ChannelTransport>,
    connector: Arc<MockPeerConnector>,
    devices: Arc<MockMediaDevices>,
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
    events: broadcast::Receiver<OrchestratorEvent>,
}

/// Orchestrator for `local`, with `others` live in the room.
async fn harness(local: &str, others: &[&str]) -> Harness {
    harness_with(local, others, OrchestratorSettings::default()).await
}

async fn harness_with(local: &str, others: &[&str], settings: OrchestratorSettings) -> Harness {
    let store = TestSignalStore::new();
    let api = store.join(TEST_ROOM, local).await;
    for other in others {
        store.join(TEST_ROOM, other).await;
    }

    let transport = ChannelTransport::new();
    let connector = MockPeerConnector::new();
    let devices = MockMediaDevices::new();
    let mut parts = scripted_parts(api, transport.clone(), connector.clone(), devices.clone());
    parts.settings = settings;
    let (handle, task) = OrchestratorActor::spawn(parts, CancellationToken::new());
    let events = handle.subscribe_events();

    Harness {
        store,
        transport,
        connector,
        devices,
        handle,
        task,
        events,
    }
}

impl Harness {
    async fn with_media(self) -> Self {
        self.handle
            .acquire_media(CaptureConstraints::default())
            .await
            .unwrap();
        self
    }

    async fn state_of(&self, remote: &str) -> Option<ConnectionState> {
        self.handle
            .peer_state(&peer(remote))
            .await
            .unwrap()
            .map(|s| s.state)
    }

    /// Originate toward `remote` and bring the link up.
    async fn connect(&mut self, remote: &str) {
        self.handle.reconcile([peer(remote)]).await.unwrap();
        self.connector.emit(remote, LinkEvent::RemoteMedia);
        wait_for_state(&mut self.events, remote, ConnectionState::Connected).await;
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}

/// Kinds of the signals `from` sent, in the order they were sent.
fn kinds_from(inbox: &[SignalingMessage], from: &str) -> Vec<SignalKind> {
    inbox
        .iter()
        .filter(|m| m.from_peer_id == peer(from))
        .map(SignalingMessage::kind)
        .collect()
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_originates_once_and_closes_departed_peers() {
    let h = harness("A", &["B"]).await;

    let first = h.handle.reconcile([peer("A"), peer("B")]).await.unwrap();
    assert_eq!(first.originated, vec![peer("B")]);
    assert!(first.closed.is_empty());

    let second = h.handle.reconcile([peer("A"), peer("B")]).await.unwrap();
    assert!(second.is_noop(), "same membership must not re-originate");
    assert_eq!(h.connector.total_links(), 1);
    assert_eq!(h.state_of("B").await, Some(ConnectionState::Connecting));

    let inbox = h.store.inbox(TEST_ROOM, "B").await;
    assert_eq!(kinds_from(&inbox, "A"), vec![SignalKind::Offer]);
    assert_eq!(inbox[0].to_peer_id, Some(peer("B")));

    let third = h.handle.reconcile([peer("A")]).await.unwrap();
    assert_eq!(third.closed, vec![peer("B")]);
    assert!(h.connector.latest_link("B").unwrap().is_closed());
    assert_eq!(h.state_of("B").await, None);

    h.stop().await;
}

#[tokio::test]
async fn test_reconcile_ignores_local_peer() {
    let h = harness("A", &[]).await;

    let outcome = h.handle.reconcile([peer("A")]).await.unwrap();

    assert!(outcome.is_noop());
    assert!(h.handle.snapshot().await.unwrap().is_empty());
    h.stop().await;
}

// ============================================================================
// Incoming offers
// ============================================================================

#[tokio::test]
async fn test_offer_without_media_is_rejected_without_state() {
    let mut h = harness("A", &["B"]).await;

    h.transport
        .deliver(signal("B", Some("A"), offer("v=0 from-b")));

    let event = wait_for_event(&mut h.events, |e| {
        matches!(e, OrchestratorEvent::IncomingRejected { .. })
    })
    .await;
    match event {
        OrchestratorEvent::IncomingRejected { peer: from, reason } => {
            assert_eq!(from, peer("B"));
            assert!(matches!(reason, MeshError::MediaUnavailable(_)));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.handle.snapshot().await.unwrap().is_empty());
    assert_eq!(h.connector.total_links(), 0);
    assert!(h.store.inbox(TEST_ROOM, "B").await.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_offer_with_media_is_answered_and_connects() {
    let mut h = harness("A", &["B"]).await.with_media().await;

    h.transport
        .deliver(signal("B", Some("A"), offer("v=0 from-b")));
    wait_for_state(&mut h.events, "B", ConnectionState::Connecting).await;
    // Round trip through the mailbox so the answer has been posted.
    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert!(!state.in_target, "incoming peer is tracked but not targeted");

    let link = h.connector.latest_link("B").unwrap();
    assert_eq!(link.log().offers_accepted, vec!["v=0 from-b".to_string()]);
    assert!(link.log().had_local_media);
    let inbox = h.store.inbox(TEST_ROOM, "B").await;
    assert_eq!(kinds_from(&inbox, "A"), vec![SignalKind::Answer]);

    link.emit(LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "B", ConnectionState::Connected).await;

    h.stop().await;
}

#[tokio::test]
async fn test_answer_and_candidates_reach_the_offering_link() {
    let h = harness("A", &["B"]).await;
    h.handle.reconcile([peer("B")]).await.unwrap();

    h.transport
        .deliver(signal("B", Some("A"), answer("v=0 answer-from-b")));
    h.transport
        .deliver(signal("B", Some("A"), candidate("candidate:1 1 UDP 1 10.0.0.2 9 typ host")));

    let link = h.connector.latest_link("B").unwrap();
    eventually(|| link.log().candidates.len() == 1).await;
    assert_eq!(link.log().answers_applied, vec!["v=0 answer-from-b".to_string()]);

    h.stop().await;
}

#[tokio::test]
async fn test_candidate_arriving_before_its_offer_is_applied() {
    let mut h = harness("A", &["B"]).await.with_media().await;

    h.transport.deliver(signal(
        "B",
        Some("A"),
        candidate("candidate:1 1 UDP 1 10.0.0.2 9 typ host"),
    ));
    h.transport
        .deliver(signal("B", Some("A"), offer("v=0 from-b")));
    wait_for_state(&mut h.events, "B", ConnectionState::Connecting).await;
    // Round trip through the mailbox so the offer has been fully handled.
    h.handle.snapshot().await.unwrap();

    let log = h.connector.latest_link("B").unwrap().log();
    assert_eq!(log.offers_accepted, vec!["v=0 from-b".to_string()]);
    assert_eq!(
        log.candidates,
        vec!["candidate:1 1 UDP 1 10.0.0.2 9 typ host".to_string()]
    );

    h.stop().await;
}

#[tokio::test]
async fn test_held_candidates_are_dropped_when_originating() {
    let h = harness("A", &["B"]).await;

    h.transport.deliver(signal(
        "B",
        Some("A"),
        candidate("candidate:9 1 UDP 1 10.0.0.9 9 typ host"),
    ));
    // Track state after the candidate proves the candidate was handled.
    h.transport
        .deliver(signal("B", Some("A"), track_state(true, true)));
    let mut states = h.handle.track_states();
    tokio::time::timeout(WAIT_LIMIT, states.wait_for(|s| s.remote.contains_key(&peer("B"))))
        .await
        .unwrap()
        .unwrap();

    h.handle.reconcile([peer("B")]).await.unwrap();
    h.transport
        .deliver(signal("B", Some("A"), answer("v=0 answer-from-b")));

    let link = h.connector.latest_link("B").unwrap();
    eventually(|| link.log().answers_applied.len() == 1).await;
    assert!(link.log().candidates.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_local_candidates_are_sent_to_the_remote_peer() {
    let h = harness("A", &["B"]).await;
    h.handle.reconcile([peer("B")]).await.unwrap();

    h.connector.emit(
        "B",
        LinkEvent::LocalCandidate(signal_protocol::IceCandidate {
            candidate: "candidate:2 1 UDP 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }),
    );

    eventually_async(|| async {
        kinds_from(&h.store.inbox(TEST_ROOM, "B").await, "A")
            == vec![SignalKind::Offer, SignalKind::IceCandidate]
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_broadcast_negotiation_signals_are_ignored() {
    let h = harness("A", &["B"]).await.with_media().await;

    h.transport.deliver(signal("B", None, offer("v=0 to-everyone")));
    // A later direct track state proves the broadcast offer was processed first.
    h.transport
        .deliver(signal("B", Some("A"), track_state(false, true)));
    let mut states = h.handle.track_states();
    tokio::time::timeout(WAIT_LIMIT, states.wait_for(|s| s.remote.contains_key(&peer("B"))))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.connector.total_links(), 0);
    h.stop().await;
}

// ============================================================================
// Failure and reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_attempt_times_out_to_failed() {
    let mut h = harness("A", &["B"]).await;
    let started = Instant::now();

    h.handle.reconcile([peer("B")]).await.unwrap();
    wait_for_state(&mut h.events, "B", ConnectionState::Failed).await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert_eq!(state.last_error, Some(MeshError::ConnectionTimeout(10_000)));
    assert_eq!(state.retry_count, 0);
    assert_eq!(h.connector.attempts_for("B").len(), 1);
    assert!(h.connector.latest_link("B").unwrap().is_closed());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_follows_schedule_then_fails() {
    let mut h = harness("A", &["B"]).await;
    h.connect("B").await;

    h.connector.fail_peer("B");
    let closed_at = Instant::now();
    h.connector.emit("B", LinkEvent::Closed);
    wait_for_state(&mut h.events, "B", ConnectionState::Failed).await;

    let attempts = h.connector.attempts_for("B");
    assert_eq!(attempts.len(), 4, "initial attempt plus three reconnects");
    let offsets: Vec<u128> = attempts[1..]
        .iter()
        .map(|at| at.duration_since(closed_at).as_millis())
        .collect();
    assert_eq!(offsets, vec![0, 2000, 4000]);

    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert_eq!(state.retry_count, 3);
    match state.last_error {
        Some(MeshError::ConnectionFailed(message)) => {
            assert!(message.contains("3 reconnect attempts failed"), "{message}");
        }
        other => panic!("unexpected last error {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempts_for("B").len(), 4, "no attempts after Failed");

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_retry_state() {
    let mut h = harness("A", &["B"]).await;
    h.connect("B").await;

    h.connector.emit("B", LinkEvent::Closed);
    wait_for_state(&mut h.events, "B", ConnectionState::Disconnected).await;
    wait_for_state(&mut h.events, "B", ConnectionState::Connecting).await;

    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert_eq!(state.retry_count, 1);
    let links = h.connector.links_for("B");
    assert_eq!(links.len(), 2);
    assert!(links[0].is_closed());

    // The first link is stale now.
    links[0].emit(LinkEvent::Closed);
    links[1].emit(LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "B", ConnectionState::Connected).await;

    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert_eq!(state.state, ConnectionState::Connected);
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.last_error, None);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_link_without_retry_schedule_fails() {
    let settings = OrchestratorSettings {
        retry_policy: RetryPolicy::new(vec![]),
        ..OrchestratorSettings::default()
    };
    let mut h = harness_with("A", &["B"], settings).await;
    h.connect("B").await;

    h.connector.emit("B", LinkEvent::Closed);
    wait_for_state(&mut h.events, "B", ConnectionState::Failed).await;

    let state = h.handle.peer_state(&peer("B")).await.unwrap().unwrap();
    assert!(matches!(state.last_error, Some(MeshError::ConnectionFailed(_))));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempts_for("B").len(), 1, "no reconnect attempted");

    h.stop().await;
}

#[tokio::test]
async fn test_closed_link_of_untargeted_peer_is_removed() {
    let mut h = harness("A", &["B"]).await.with_media().await;
    h.transport
        .deliver(signal("B", Some("A"), offer("v=0 from-b")));
    wait_for_state(&mut h.events, "B", ConnectionState::Connecting).await;
    h.connector.emit("B", LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "B", ConnectionState::Connected).await;

    h.connector.emit("B", LinkEvent::Closed);
    wait_for_event(&mut h.events, |e| {
        matches!(e, OrchestratorEvent::PeerRemoved { peer: p } if *p == peer("B"))
    })
    .await;

    assert_eq!(h.state_of("B").await, None);
    assert_eq!(h.connector.total_links(), 1, "no reconnect toward an untargeted peer");
    h.stop().await;
}

#[tokio::test]
async fn test_failure_is_isolated_per_peer() {
    let mut h = harness("A", &["B", "C"]).await;
    h.connector.fail_peer("B");

    h.handle.reconcile([peer("B"), peer("C")]).await.unwrap();
    h.connector.emit("C", LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "C", ConnectionState::Connected).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot[&peer("B")].state, ConnectionState::Failed);
    assert!(matches!(
        snapshot[&peer("B")].last_error,
        Some(MeshError::ConnectionFailed(_))
    ));
    assert_eq!(snapshot[&peer("C")].state, ConnectionState::Connected);
    assert_eq!(snapshot[&peer("C")].last_error, None);

    h.stop().await;
}

// ============================================================================
// Glare
// ============================================================================

#[tokio::test]
async fn test_glare_lower_id_keeps_its_offer() {
    let h = harness("A", &["B"]).await.with_media().await;
    h.handle.reconcile([peer("B")]).await.unwrap();

    h.transport
        .deliver(signal("B", Some("A"), offer("v=0 glare-from-b")));
    h.transport
        .deliver(signal("B", Some("A"), answer("v=0 answer-from-b")));

    let link = h.connector.latest_link("B").unwrap();
    eventually(|| link.log().answers_applied.len() == 1).await;
    assert!(link.log().offers_accepted.is_empty());
    assert_eq!(h.connector.total_links(), 1);
    assert!(!link.is_closed());

    h.stop().await;
}

#[tokio::test]
async fn test_glare_higher_id_yields_to_remote_offer() {
    let h = harness("B", &["A"]).await.with_media().await;
    h.handle.reconcile([peer("A")]).await.unwrap();

    h.transport
        .deliver(signal("A", Some("B"), offer("v=0 glare-from-a")));

    eventually(|| h.connector.links_for("A").len() == 2).await;
    let links = h.connector.links_for("A");
    assert!(links[0].is_closed(), "own offering link is discarded");
    eventually(|| links[1].log().offers_accepted.len() == 1).await;

    eventually_async(|| async {
        kinds_from(&h.store.inbox(TEST_ROOM, "A").await, "B")
            == vec![SignalKind::Offer, SignalKind::Answer]
    })
    .await;
    assert_eq!(h.state_of("A").await, Some(ConnectionState::Connecting));

    h.stop().await;
}

// ============================================================================
// Media
// ============================================================================

#[tokio::test]
async fn test_track_toggle_broadcasts_without_stopping_capture() {
    let h = harness("A", &["B", "C"]).await.with_media().await;

    let state = h.handle.set_video_enabled(false).await.unwrap();
    assert_eq!(
        state,
        TrackState {
            video_enabled: false,
            audio_enabled: true
        }
    );

    let video = h
        .devices
        .acquired_tracks()
        .into_iter()
        .find(|t| t.kind() == TrackKind::Video)
        .unwrap();
    assert!(!video.is_enabled());
    assert!(!video.is_stopped());
    assert_eq!(h.handle.track_states().borrow().local, state);

    for member in ["B", "C"] {
        let inbox = h.store.inbox(TEST_ROOM, member).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].to_peer_id, None);
        assert_eq!(inbox[0].message, SignalPayload::TrackState(state));
    }

    h.stop().await;
}

#[tokio::test]
async fn test_track_toggle_without_media_fails() {
    let h = harness("A", &[]).await;

    let result = h.handle.set_audio_enabled(false).await;

    assert!(matches!(result, Err(MeshError::MediaUnavailable(_))));
    h.stop().await;
}

#[tokio::test]
async fn test_remote_track_state_updates_watch() {
    let h = harness("A", &["B"]).await;
    let mut states = h.handle.track_states();

    h.transport.deliver(signal("B", None, track_state(true, false)));

    let current = tokio::time::timeout(
        WAIT_LIMIT,
        states.wait_for(|s| s.remote.contains_key(&peer("B"))),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(
        current.remote[&peer("B")],
        TrackState {
            video_enabled: true,
            audio_enabled: false
        }
    );

    h.stop().await;
}

#[tokio::test]
async fn test_device_switch_replaces_track_on_connected_peers() {
    let mut h = harness("A", &["B", "C"]).await.with_media().await;
    h.handle.reconcile([peer("B"), peer("C")]).await.unwrap();
    h.connector.emit("B", LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "B", ConnectionState::Connected).await;

    let replaced = h.handle.switch_video_device("usb-cam").await.unwrap();
    assert_eq!(replaced, 1, "only the connected peer gets the new track");

    let tracks = h.devices.acquired_tracks();
    let old = tracks
        .iter()
        .find(|t| t.kind() == TrackKind::Video && t.device_id() == "default-cam")
        .unwrap();
    let new = tracks
        .iter()
        .find(|t| t.kind() == TrackKind::Video && t.device_id() == "usb-cam")
        .unwrap();
    assert!(old.is_stopped());
    assert!(!new.is_stopped());

    assert_eq!(
        h.connector.latest_link("B").unwrap().log().replaced_video,
        vec![new.id().to_string()]
    );
    assert!(h.connector.latest_link("C").unwrap().log().replaced_video.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_device_switch_replace_failure_is_reported_per_peer() {
    let mut h = harness("A", &["B", "C"]).await.with_media().await;
    h.handle.reconcile([peer("B"), peer("C")]).await.unwrap();
    h.connector.emit("B", LinkEvent::RemoteMedia);
    h.connector.emit("C", LinkEvent::RemoteMedia);
    wait_for_state(&mut h.events, "B", ConnectionState::Connected).await;
    wait_for_state(&mut h.events, "C", ConnectionState::Connected).await;
    h.connector.fail_replace_for("B");

    let replaced = h.handle.switch_video_device("usb-cam").await.unwrap();

    assert_eq!(replaced, 1);
    let event = wait_for_event(&mut h.events, |e| {
        matches!(e, OrchestratorEvent::PeerError { .. })
    })
    .await;
    assert!(matches!(event, OrchestratorEvent::PeerError { peer: p, .. } if p == peer("B")));
    assert_eq!(h.state_of("B").await, Some(ConnectionState::Connected));

    h.stop().await;
}

#[tokio::test]
async fn test_acquire_media_failure_is_reported() {
    let h = harness("A", &[]).await;
    h.devices.refuse();

    let result = h.handle.acquire_media(CaptureConstraints::default()).await;

    assert!(matches!(result, Err(MeshError::MediaUnavailable(_))));
    h.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_tears_down_even_when_a_close_fails() {
    let h = harness("A", &["B", "C"]).await.with_media().await;
    h.handle.reconcile([peer("B"), peer("C")]).await.unwrap();
    h.connector.fail_close_for("B");

    let connector = h.connector.clone();
    let devices = h.devices.clone();
    let transport = h.transport.clone();
    let states = h.handle.track_states();
    h.stop().await;

    assert!(connector.latest_link("B").unwrap().is_closed());
    assert!(connector.latest_link("C").unwrap().is_closed());
    assert!(devices.all_stopped());
    assert_eq!(
        states.borrow().local,
        TrackState {
            video_enabled: false,
            audio_enabled: false
        }
    );
    assert_eq!(transport.subscriber_count(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_the_actor() {
    let h = harness("A", &["B"]).await.with_media().await;
    h.handle.reconcile([peer("B")]).await.unwrap();

    h.handle.cancel();
    tokio::time::timeout(WAIT_LIMIT, h.task).await.unwrap().unwrap();

    assert!(h.connector.latest_link("B").unwrap().is_closed());
    assert!(h.devices.all_stopped());
    assert!(h.handle.snapshot().await.is_err());
}

#[tokio::test]
async fn test_transport_errors_are_forwarded() {
    let mut h = harness("A", &[]).await;

    h.transport.fail(MeshError::TransportExhausted(5));

    let event = wait_for_event(&mut h.events, |e| {
        matches!(e, OrchestratorEvent::TransportError(_))
    })
    .await;
    assert_eq!(
        event,
        OrchestratorEvent::TransportError(MeshError::TransportExhausted(5))
    );
    h.stop().await;
}

/// Async variant of [`eventually`] for conditions that query the store.
async fn eventually_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
