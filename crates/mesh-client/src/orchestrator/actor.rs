//! Orchestrator actor.
//!
//! One task owns every peer entry, link and timer for a (local peer, room)
//! scope. Callers talk to it through [`OrchestratorHandle`]; signals arrive
//! from the transport subscription, link callbacks and timers arrive on
//! internal channels. Each connection attempt gets a fresh generation number
//! and anything tagged with an older generation is ignored.

use super::link::{LinkEvent, LinkEvents, LinkNotice, PeerConnector, PeerLink};
use super::state::{ConnectionState, PeerConnectionState, RetryPolicy};
use crate::api::{SignalApi, SignalOutbox};
use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::media::{CaptureConstraints, LocalMediaController, MediaDeviceInfo, MediaDevices, TrackKind};
use crate::observability::metrics;
use crate::transport::{SignalTransport, Subscription, TransportEvent};
use signal_protocol::{
    IceCandidate, PeerId, RoomId, SessionDescription, SignalPayload, SignalingMessage, TrackState,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mailbox size.
const ORCHESTRATOR_CHANNEL_BUFFER: usize = 64;

/// Event fan-out capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Remote candidates held per peer while no link exists; oldest dropped first.
const MAX_PENDING_CANDIDATES: usize = 32;

/// Timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry_policy: RetryPolicy,
    /// Time allowed for remote media to arrive after an attempt starts.
    pub attempt_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&MeshConfig> for OrchestratorSettings {
    fn from(config: &MeshConfig) -> Self {
        Self {
            retry_policy: config.retry_policy(),
            attempt_timeout: config.attempt_timeout,
        }
    }
}

/// Collaborators an orchestrator is built from.
pub struct OrchestratorParts {
    pub room: RoomId,
    /// Store client; its identity is the local peer.
    pub api: Arc<dyn SignalApi>,
    pub transport: Arc<dyn SignalTransport>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub settings: OrchestratorSettings,
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    PeerStateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    /// Per-peer failure. Never affects other peers.
    PeerError { peer: PeerId, error: MeshError },
    /// Peer left the target set (or its incoming-only link closed).
    PeerRemoved { peer: PeerId },
    /// Incoming offer refused without creating state.
    IncomingRejected { peer: PeerId, reason: MeshError },
    /// Transport problem. Terminal when `is_terminal()`.
    TransportError(MeshError),
}

/// Local and remote track enablement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackStates {
    pub local: TrackState,
    pub remote: BTreeMap<PeerId, TrackState>,
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub originated: Vec<PeerId>,
    pub closed: Vec<PeerId>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.originated.is_empty() && self.closed.is_empty()
    }
}

/// Messages handled by the orchestrator.
#[derive(Debug)]
pub(crate) enum OrchestratorMessage {
    AcquireMedia {
        constraints: CaptureConstraints,
        respond_to: oneshot::Sender<Result<TrackState, MeshError>>,
    },
    EnumerateDevices {
        respond_to: oneshot::Sender<Result<Vec<MediaDeviceInfo>, MeshError>>,
    },
    Reconcile {
        target: BTreeSet<PeerId>,
        respond_to: oneshot::Sender<ReconcileOutcome>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<TrackState, MeshError>>,
    },
    SwitchVideoDevice {
        device_id: String,
        respond_to: oneshot::Sender<Result<usize, MeshError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<BTreeMap<PeerId, PeerConnectionState>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to an [`OrchestratorActor`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<OrchestratorMessage>,
    cancel_token: CancellationToken,
    local: PeerId,
    room: RoomId,
    events: broadcast::Sender<OrchestratorEvent>,
    track_states: watch::Receiver<TrackStates>,
}

impl OrchestratorHandle {
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Open local capture. Required before incoming offers are accepted.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if capture cannot be opened.
    pub async fn acquire_media(&self, constraints: CaptureConstraints) -> Result<TrackState, MeshError> {
        self.request(|respond_to| OrchestratorMessage::AcquireMedia {
            constraints,
            respond_to,
        })
        .await?
    }

    /// List capture devices.
    ///
    /// # Errors
    ///
    /// Device enumeration errors, or `Internal` if the actor is gone.
    pub async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MeshError> {
        self.request(|respond_to| OrchestratorMessage::EnumerateDevices { respond_to })
            .await?
    }

    /// Apply a membership update. The local peer is ignored if present.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor is gone.
    pub async fn reconcile(
        &self,
        target: impl IntoIterator<Item = PeerId>,
    ) -> Result<ReconcileOutcome, MeshError> {
        let target = target.into_iter().collect();
        self.request(|respond_to| OrchestratorMessage::Reconcile { target, respond_to })
            .await
    }

    /// Mute or unmute a local track and tell the room.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if there is no such track.
    pub async fn set_track_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<TrackState, MeshError> {
        self.request(|respond_to| OrchestratorMessage::SetTrackEnabled {
            kind,
            enabled,
            respond_to,
        })
        .await?
    }

    /// Shorthand for [`set_track_enabled`](Self::set_track_enabled) on video.
    ///
    /// # Errors
    ///
    /// See [`set_track_enabled`](Self::set_track_enabled).
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<TrackState, MeshError> {
        self.set_track_enabled(TrackKind::Video, enabled).await
    }

    /// Shorthand for [`set_track_enabled`](Self::set_track_enabled) on audio.
    ///
    /// # Errors
    ///
    /// See [`set_track_enabled`](Self::set_track_enabled).
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<TrackState, MeshError> {
        self.set_track_enabled(TrackKind::Audio, enabled).await
    }

    /// Switch camera. Returns how many connected peers got the new track.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if there is no current video or the device fails.
    pub async fn switch_video_device(&self, device_id: impl Into<String>) -> Result<usize, MeshError> {
        let device_id = device_id.into();
        self.request(|respond_to| OrchestratorMessage::SwitchVideoDevice {
            device_id,
            respond_to,
        })
        .await?
    }

    /// State of every tracked peer.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor is gone.
    pub async fn snapshot(&self) -> Result<BTreeMap<PeerId, PeerConnectionState>, MeshError> {
        self.request(|respond_to| OrchestratorMessage::Snapshot { respond_to })
            .await
    }

    /// State of one peer, `None` if untracked.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor is gone.
    pub async fn peer_state(&self, peer: &PeerId) -> Result<Option<PeerConnectionState>, MeshError> {
        Ok(self.snapshot().await?.remove(peer))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn track_states(&self) -> watch::Receiver<TrackStates> {
        self.track_states.clone()
    }

    /// Tear everything down and stop the actor.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor already stopped.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|respond_to| OrchestratorMessage::Shutdown { respond_to })
            .await
    }

    /// Cancel the actor. It tears down before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> OrchestratorMessage,
    ) -> Result<T, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    AttemptTimeout,
    Retry,
}

#[derive(Debug)]
struct TimerFired {
    peer: PeerId,
    generation: u64,
    kind: TimerKind,
}

struct PeerEntry {
    state: ConnectionState,
    /// Generation of the current (or last) attempt.
    generation: u64,
    role: Option<Role>,
    link: Option<Box<dyn PeerLink>>,
    /// Set while recovering from a close; retry offsets count from here.
    closed_at: Option<Instant>,
    retry_count: u32,
    last_error: Option<MeshError>,
    timer: Option<CancellationToken>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            role: None,
            link: None,
            closed_at: None,
            retry_count: 0,
            last_error: None,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// The orchestrator actor.
pub struct OrchestratorActor {
    local: PeerId,
    room: RoomId,
    receiver: mpsc::Receiver<OrchestratorMessage>,
    cancel_token: CancellationToken,
    outbox: SignalOutbox,
    subscription: Option<Subscription>,
    connector: Arc<dyn PeerConnector>,
    media: LocalMediaController,
    settings: OrchestratorSettings,
    peers: HashMap<PeerId, PeerEntry>,
    /// Candidates that arrived before the offer they belong to.
    pending_candidates: HashMap<PeerId, VecDeque<IceCandidate>>,
    target: BTreeSet<PeerId>,
    next_generation: u64,
    link_tx: mpsc::UnboundedSender<LinkNotice>,
    link_rx: mpsc::UnboundedReceiver<LinkNotice>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    events: broadcast::Sender<OrchestratorEvent>,
    track_states: watch::Sender<TrackStates>,
}

impl OrchestratorActor {
    /// Spawn an orchestrator and subscribe it to the room's signals.
    ///
    /// Returns a handle and the task join handle. Must be called from within
    /// a tokio runtime.
    pub fn spawn(
        parts: OrchestratorParts,
        cancel_token: CancellationToken,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let OrchestratorParts {
            room,
            api,
            transport,
            connector,
            devices,
            settings,
        } = parts;
        let local = api.identity().clone();

        let (sender, receiver) = mpsc::channel(ORCHESTRATOR_CHANNEL_BUFFER);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let media = LocalMediaController::new(devices);
        let (track_states, track_states_rx) = watch::channel(TrackStates {
            local: media.track_state(),
            remote: BTreeMap::new(),
        });

        let subscription = transport.subscribe(&room, &local);
        info!(
            target: "mesh.orchestrator",
            room_id = %room,
            peer_id = %local,
            transport = ?transport.kind(),
            "Subscribed to signals"
        );

        let actor = Self {
            local: local.clone(),
            room: room.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            outbox: SignalOutbox::new(api),
            subscription: Some(subscription),
            connector,
            media,
            settings,
            peers: HashMap::new(),
            pending_candidates: HashMap::new(),
            target: BTreeSet::new(),
            next_generation: 1,
            link_tx,
            link_rx,
            timer_tx,
            timer_rx,
            events: events.clone(),
            track_states,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = OrchestratorHandle {
            sender,
            cancel_token,
            local,
            room,
            events,
            track_states: track_states_rx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.orchestrator", fields(room_id = %self.room, peer_id = %self.local))]
    async fn run(mut self) {
        info!(target: "mesh.orchestrator", "Orchestrator started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "mesh.orchestrator", "Orchestrator received cancellation signal");
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(OrchestratorMessage::Shutdown { respond_to }) => {
                            self.graceful_shutdown().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(target: "mesh.orchestrator", "Orchestrator channel closed, exiting");
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                Some(notice) = self.link_rx.recv() => {
                    self.handle_link_event(notice).await;
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.handle_timer(fired).await;
                }

                event = next_transport_event(&mut self.subscription) => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            warn!(target: "mesh.orchestrator", "Signal delivery ended");
                            if let Some(subscription) = self.subscription.take() {
                                subscription.close().await;
                            }
                        }
                    }
                }
            }
        }

        info!(target: "mesh.orchestrator", "Orchestrator stopped");
    }

    async fn handle_message(&mut self, message: OrchestratorMessage) {
        match message {
            OrchestratorMessage::AcquireMedia {
                constraints,
                respond_to,
            } => {
                let result = self.acquire_media(constraints).await;
                let _ = respond_to.send(result);
            }
            OrchestratorMessage::EnumerateDevices { respond_to } => {
                let result = self.media.enumerate_devices().await;
                let _ = respond_to.send(result);
            }
            OrchestratorMessage::Reconcile { target, respond_to } => {
                let outcome = self.reconcile(target).await;
                let _ = respond_to.send(outcome);
            }
            OrchestratorMessage::SetTrackEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(kind, enabled).await;
                let _ = respond_to.send(result);
            }
            OrchestratorMessage::SwitchVideoDevice {
                device_id,
                respond_to,
            } => {
                let result = self.switch_video_device(&device_id).await;
                let _ = respond_to.send(result);
            }
            OrchestratorMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            OrchestratorMessage::Shutdown { respond_to } => {
                // Handled in the run loop.
                let _ = respond_to.send(());
            }
        }
    }

    async fn acquire_media(&mut self, constraints: CaptureConstraints) -> Result<TrackState, MeshError> {
        self.media.acquire(constraints).await?;
        let state = self.media.track_state();
        self.track_states.send_modify(|states| states.local = state);
        Ok(state)
    }

    /// Originate toward new target peers and drop peers that left.
    async fn reconcile(&mut self, mut target: BTreeSet<PeerId>) -> ReconcileOutcome {
        target.remove(&self.local);

        let mut closed: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|peer| !target.contains(*peer))
            .cloned()
            .collect();
        closed.sort();
        for peer in &closed {
            self.remove_peer(peer).await;
        }

        let originated: Vec<PeerId> = target
            .iter()
            .filter(|peer| !self.peers.contains_key(*peer))
            .cloned()
            .collect();
        self.target = target;

        for peer in &originated {
            self.peers.insert(peer.clone(), PeerEntry::new());
            self.start_outgoing(peer).await;
        }

        if !originated.is_empty() || !closed.is_empty() {
            info!(
                target: "mesh.orchestrator",
                originated = originated.len(),
                closed = closed.len(),
                target_size = self.target.len(),
                "Mesh reconciled"
            );
        }
        ReconcileOutcome { originated, closed }
    }

    async fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<TrackState, MeshError> {
        let state = self.media.set_enabled(kind, enabled)?;
        self.track_states.send_modify(|states| states.local = state);

        if let Err(e) = self
            .outbox
            .send(&self.room, None, &SignalPayload::TrackState(state))
            .await
        {
            warn!(target: "mesh.orchestrator", error = %e, "Track state broadcast failed");
        }
        Ok(state)
    }

    /// Hot-swap the camera into every connected peer, then stop the old one.
    async fn switch_video_device(&mut self, device_id: &str) -> Result<usize, MeshError> {
        let track = self.media.prepare_video_switch(device_id).await?;

        let mut connected: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        connected.sort();

        let mut replaced = 0;
        for peer in connected {
            let Some(link) = self.peers.get_mut(&peer).and_then(|e| e.link.as_mut()) else {
                continue;
            };
            match link.replace_video_track(&track).await {
                Ok(()) => replaced += 1,
                Err(e) => {
                    warn!(target: "mesh.orchestrator", remote = %peer, error = %e, "Video track replace failed");
                    self.emit(OrchestratorEvent::PeerError { peer, error: e });
                }
            }
        }

        self.media.commit_video_switch()?;
        Ok(replaced)
    }

    fn snapshot(&self) -> BTreeMap<PeerId, PeerConnectionState> {
        self.peers
            .iter()
            .map(|(peer, entry)| {
                (
                    peer.clone(),
                    PeerConnectionState {
                        state: entry.state,
                        retry_count: entry.retry_count,
                        last_error: entry.last_error.clone(),
                        in_target: self.target.contains(peer),
                    },
                )
            })
            .collect()
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.handle_signal(message).await,
            TransportEvent::Error(e) => {
                if e.is_terminal() {
                    error!(target: "mesh.orchestrator", error = %e, "Signal transport failed");
                } else {
                    warn!(target: "mesh.orchestrator", error = %e, "Signal transport error");
                }
                self.emit(OrchestratorEvent::TransportError(e));
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        if let Err(e) = message.message.validate() {
            warn!(
                target: "mesh.orchestrator",
                signal_id = %message.id,
                from = %message.from_peer_id,
                error = %e,
                "Dropping malformed signal"
            );
            metrics::record_signal_dropped("malformed");
            return;
        }
        if message.is_broadcast() && !matches!(message.message, SignalPayload::TrackState(_)) {
            debug!(
                target: "mesh.orchestrator",
                signal_id = %message.id,
                kind = %message.kind(),
                "Dropping broadcast negotiation signal"
            );
            metrics::record_signal_dropped("misaddressed");
            return;
        }

        let SignalingMessage {
            from_peer_id: from,
            message: payload,
            ..
        } = message;
        match payload {
            SignalPayload::Offer(offer) => self.on_remote_offer(from, offer).await,
            SignalPayload::Answer(answer) => self.on_remote_answer(from, answer).await,
            SignalPayload::IceCandidate(candidate) => self.on_remote_candidate(from, candidate).await,
            SignalPayload::TrackState(state) => self.on_remote_track_state(from, state),
        }
    }

    async fn on_remote_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if !self.media.is_available() {
            warn!(target: "mesh.orchestrator", remote = %from, "Rejecting offer: no local media");
            self.emit(OrchestratorEvent::IncomingRejected {
                peer: from,
                reason: MeshError::MediaUnavailable("local media not acquired".to_string()),
            });
            return;
        }

        if let Some(entry) = self.peers.get(&from) {
            if entry.state == ConnectionState::Connecting && entry.role == Some(Role::Offerer) {
                if self.local < from {
                    debug!(target: "mesh.orchestrator", remote = %from, "Glare: keeping local offer");
                    return;
                }
                debug!(target: "mesh.orchestrator", remote = %from, "Glare: yielding to remote offer");
            }
        } else {
            debug!(target: "mesh.orchestrator", remote = %from, "Offer from untracked peer");
            self.peers.insert(from.clone(), PeerEntry::new());
        }

        self.start_incoming(from, offer).await;
    }

    async fn on_remote_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let Some(entry) = self.peers.get_mut(&from) else {
            debug!(target: "mesh.orchestrator", remote = %from, "Answer from untracked peer");
            return;
        };
        if entry.state != ConnectionState::Connecting || entry.role != Some(Role::Offerer) {
            debug!(target: "mesh.orchestrator", remote = %from, state = %entry.state, "Unexpected answer");
            return;
        }
        let generation = entry.generation;
        let Some(link) = entry.link.as_mut() else {
            return;
        };

        if let Err(e) = link.apply_answer(&answer).await {
            self.attempt_failed(&from, generation, e).await;
        }
    }

    async fn on_remote_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        let Some(link) = self.peers.get_mut(&from).and_then(|e| e.link.as_mut()) else {
            let pending = self.pending_candidates.entry(from.clone()).or_default();
            if pending.len() == MAX_PENDING_CANDIDATES {
                pending.pop_front();
                metrics::record_signal_dropped("candidate_overflow");
            }
            pending.push_back(candidate);
            debug!(
                target: "mesh.orchestrator",
                remote = %from,
                pending = pending.len(),
                "Holding candidate until a link exists"
            );
            return;
        };
        if let Err(e) = link.add_remote_candidate(&candidate).await {
            warn!(target: "mesh.orchestrator", remote = %from, error = %e, "Remote candidate rejected");
        }
    }

    /// Hand held candidates to the link that just accepted `peer`'s offer.
    async fn apply_pending_candidates(&mut self, peer: &PeerId) {
        let Some(pending) = self.pending_candidates.remove(peer) else {
            return;
        };
        let Some(link) = self.peers.get_mut(peer).and_then(|e| e.link.as_mut()) else {
            return;
        };
        debug!(target: "mesh.orchestrator", remote = %peer, count = pending.len(), "Applying held candidates");
        for candidate in pending {
            if let Err(e) = link.add_remote_candidate(&candidate).await {
                warn!(target: "mesh.orchestrator", remote = %peer, error = %e, "Remote candidate rejected");
            }
        }
    }

    fn on_remote_track_state(&mut self, from: PeerId, state: TrackState) {
        debug!(
            target: "mesh.orchestrator",
            remote = %from,
            video = state.video_enabled,
            audio = state.audio_enabled,
            "Remote track state"
        );
        self.track_states.send_modify(|states| {
            states.remote.insert(from, state);
        });
    }

    /// Start a new attempt: next generation, `Connecting`, old timer cancelled.
    fn begin_attempt(&mut self, peer: &PeerId, role: Role) -> Option<u64> {
        let generation = self.next_generation;
        let entry = self.peers.get_mut(peer)?;
        self.next_generation += 1;
        entry.cancel_timer();
        entry.generation = generation;
        entry.role = Some(role);
        self.set_state(peer, ConnectionState::Connecting);
        Some(generation)
    }

    async fn start_outgoing(&mut self, peer: &PeerId) {
        self.discard_link(peer).await;
        // Held candidates belong to an offer this attempt replaces.
        self.pending_candidates.remove(peer);
        let Some(generation) = self.begin_attempt(peer, Role::Offerer) else {
            return;
        };
        let events = LinkEvents::new(peer.clone(), generation, self.link_tx.clone());

        let mut link = match self
            .connector
            .create_link(peer, self.media.local_stream(), events)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.attempt_failed(peer, generation, e).await;
                return;
            }
        };

        let sent = match link.create_offer().await {
            Ok(offer) => {
                self.outbox
                    .send(&self.room, Some(peer), &SignalPayload::Offer(offer))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            close_link(peer, link).await;
            self.attempt_failed(peer, generation, e).await;
            return;
        }

        self.install_link(peer, generation, link);
        debug!(target: "mesh.orchestrator", remote = %peer, generation = generation, "Offer sent");
    }

    async fn start_incoming(&mut self, peer: PeerId, offer: SessionDescription) {
        self.discard_link(&peer).await;
        let Some(generation) = self.begin_attempt(&peer, Role::Answerer) else {
            return;
        };
        let events = LinkEvents::new(peer.clone(), generation, self.link_tx.clone());

        let mut link = match self
            .connector
            .create_link(&peer, self.media.local_stream(), events)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.attempt_failed(&peer, generation, e).await;
                return;
            }
        };

        let sent = match link.accept_offer(&offer).await {
            Ok(answer) => {
                self.outbox
                    .send(&self.room, Some(&peer), &SignalPayload::Answer(answer))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            close_link(&peer, link).await;
            self.attempt_failed(&peer, generation, e).await;
            return;
        }

        self.install_link(&peer, generation, link);
        self.apply_pending_candidates(&peer).await;
        debug!(target: "mesh.orchestrator", remote = %peer, generation = generation, "Answer sent");
    }

    /// Store the link of a live attempt and start its media timeout.
    fn install_link(&mut self, peer: &PeerId, generation: u64, link: Box<dyn PeerLink>) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.link = Some(link);
        let timeout = self.settings.attempt_timeout;
        self.arm_timer(peer, generation, timeout, TimerKind::AttemptTimeout);
    }

    async fn handle_link_event(&mut self, notice: LinkNotice) {
        let LinkNotice {
            peer,
            generation,
            event,
        } = notice;
        let Some(state) = self
            .peers
            .get(&peer)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.state)
        else {
            debug!(target: "mesh.orchestrator", remote = %peer, generation = generation, "Stale link event");
            return;
        };

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .outbox
                    .send(&self.room, Some(&peer), &SignalPayload::IceCandidate(candidate))
                    .await
                {
                    warn!(target: "mesh.orchestrator", remote = %peer, error = %e, "Candidate send failed");
                }
            }
            LinkEvent::RemoteMedia => {
                if state == ConnectionState::Connecting {
                    self.on_connected(&peer);
                }
            }
            LinkEvent::Closed => self.on_link_closed(&peer, generation, "channel closed").await,
            LinkEvent::Failed(reason) => match state {
                ConnectionState::Connecting => {
                    self.attempt_failed(&peer, generation, MeshError::ConnectionFailed(reason))
                        .await;
                }
                ConnectionState::Connected => {
                    self.on_link_closed(&peer, generation, &reason).await;
                }
                _ => {}
            },
        }
    }

    fn on_connected(&mut self, peer: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.cancel_timer();
        entry.closed_at = None;
        entry.retry_count = 0;
        entry.last_error = None;
        self.set_state(peer, ConnectionState::Connected);
        info!(target: "mesh.orchestrator", remote = %peer, "Peer connected");
    }

    async fn on_link_closed(&mut self, peer: &PeerId, generation: u64, reason: &str) {
        let Some(state) = self.peers.get(peer).map(|e| e.state) else {
            return;
        };

        match state {
            ConnectionState::Connecting => {
                self.attempt_failed(
                    peer,
                    generation,
                    MeshError::ConnectionFailed(format!("closed during setup: {reason}")),
                )
                .await;
            }
            ConnectionState::Connected => {
                info!(target: "mesh.orchestrator", remote = %peer, reason = reason, "Peer link closed");
                if !self.target.contains(peer) {
                    self.remove_peer(peer).await;
                    return;
                }

                self.discard_link(peer).await;
                if let Some(entry) = self.peers.get_mut(peer) {
                    entry.closed_at = Some(Instant::now());
                    entry.retry_count = 0;
                }
                self.set_state(peer, ConnectionState::Disconnected);
                self.schedule_retry(peer);
            }
            _ => {}
        }
    }

    /// Close out the attempt `generation` with `error`.
    ///
    /// Inside a reconnect cycle this schedules the next retry until the
    /// schedule is spent; otherwise the peer ends in `Failed`.
    async fn attempt_failed(&mut self, peer: &PeerId, generation: u64, error: MeshError) {
        let max_retries = self.settings.retry_policy.max_retries();
        let Some(entry) = self
            .peers
            .get_mut(peer)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        if entry.state != ConnectionState::Connecting {
            return;
        }

        entry.cancel_timer();
        let link = entry.link.take();
        let reconnecting = entry.closed_at.is_some();
        let retries_left = entry.retry_count < max_retries;
        let retry_count = entry.retry_count;

        warn!(
            target: "mesh.orchestrator",
            remote = %peer,
            error = %error,
            retry_count = retry_count,
            "Connection attempt failed"
        );
        if let Some(link) = link {
            close_link(peer, link).await;
        }

        let terminal = if reconnecting && retries_left {
            None
        } else if reconnecting {
            Some(MeshError::ConnectionFailed(format!(
                "{retry_count} reconnect attempts failed, last error: {error}"
            )))
        } else {
            Some(error.clone())
        };

        if let Some(entry) = self.peers.get_mut(peer) {
            entry.last_error = Some(terminal.clone().unwrap_or_else(|| error.clone()));
        }
        self.emit(OrchestratorEvent::PeerError {
            peer: peer.clone(),
            error: terminal.clone().unwrap_or(error),
        });

        if terminal.is_some() {
            self.set_state(peer, ConnectionState::Failed);
        } else {
            self.set_state(peer, ConnectionState::Disconnected);
            self.schedule_retry(peer);
        }
    }

    /// Arm the next reconnect at `closed_at + offset`, or now if that has passed.
    ///
    /// With nothing left in the schedule the peer goes straight to `Failed`.
    fn schedule_retry(&mut self, peer: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(closed_at) = entry.closed_at else {
            return;
        };
        let Some(offset) = self.settings.retry_policy.offset(entry.retry_count) else {
            let error = MeshError::ConnectionFailed(format!(
                "link closed with no reconnect attempts left after {}",
                entry.retry_count
            ));
            warn!(target: "mesh.orchestrator", remote = %peer, error = %error, "Reconnect schedule exhausted");
            entry.last_error = Some(error.clone());
            self.emit(OrchestratorEvent::PeerError {
                peer: peer.clone(),
                error,
            });
            self.set_state(peer, ConnectionState::Failed);
            return;
        };
        let generation = entry.generation;
        let delay = (closed_at + offset).saturating_duration_since(Instant::now());

        debug!(
            target: "mesh.orchestrator",
            remote = %peer,
            attempt = entry.retry_count + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );
        self.arm_timer(peer, generation, delay, TimerKind::Retry);
    }

    fn arm_timer(&mut self, peer: &PeerId, generation: u64, delay: Duration, kind: TimerKind) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.cancel_timer();

        let token = self.cancel_token.child_token();
        entry.timer = Some(token.clone());
        let sender = self.timer_tx.clone();
        let fired = TimerFired {
            peer: peer.clone(),
            generation,
            kind,
        };

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = sender.send(fired);
                }
            }
        });
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        let TimerFired {
            peer,
            generation,
            kind,
        } = fired;
        let Some(entry) = self
            .peers
            .get_mut(&peer)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        entry.timer = None;

        match kind {
            TimerKind::AttemptTimeout => {
                if entry.state == ConnectionState::Connecting {
                    let timeout_ms =
                        u64::try_from(self.settings.attempt_timeout.as_millis()).unwrap_or(u64::MAX);
                    self.attempt_failed(&peer, generation, MeshError::ConnectionTimeout(timeout_ms))
                        .await;
                }
            }
            TimerKind::Retry => {
                if entry.state != ConnectionState::Disconnected {
                    return;
                }
                if !self.target.contains(&peer) {
                    self.remove_peer(&peer).await;
                    return;
                }
                entry.retry_count += 1;
                info!(
                    target: "mesh.orchestrator",
                    remote = %peer,
                    attempt = entry.retry_count,
                    "Reconnecting"
                );
                self.start_outgoing(&peer).await;
            }
        }
    }

    /// Close and forget the peer's current link, if any.
    async fn discard_link(&mut self, peer: &PeerId) {
        let link = self.peers.get_mut(peer).and_then(|e| e.link.take());
        if let Some(link) = link {
            close_link(peer, link).await;
        }
    }

    /// Tear down a peer regardless of state.
    async fn remove_peer(&mut self, peer: &PeerId) {
        self.pending_candidates.remove(peer);
        let Some(mut entry) = self.peers.remove(peer) else {
            return;
        };
        entry.cancel_timer();
        if let Some(link) = entry.link.take() {
            close_link(peer, link).await;
        }
        self.track_states.send_if_modified(|states| states.remote.remove(peer).is_some());

        metrics::record_peer_transition("removed");
        debug!(target: "mesh.orchestrator", remote = %peer, state = %entry.state, "Peer removed");
        self.emit(OrchestratorEvent::PeerRemoved { peer: peer.clone() });
    }

    fn set_state(&mut self, peer: &PeerId, state: ConnectionState) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if entry.state == state {
            return;
        }
        debug!(
            target: "mesh.orchestrator",
            remote = %peer,
            from = %entry.state,
            to = %state,
            "Peer state changed"
        );
        entry.state = state;
        metrics::record_peer_transition(state.as_str());
        self.emit(OrchestratorEvent::PeerStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Close every link, stop capture, cancel timers and detach the transport.
    ///
    /// Individual close failures are logged and teardown continues.
    async fn graceful_shutdown(&mut self) {
        let mut peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        peers.sort();
        info!(target: "mesh.orchestrator", peers = peers.len(), "Tearing down room scope");

        for peer in &peers {
            self.remove_peer(peer).await;
        }
        self.pending_candidates.clear();
        self.target.clear();
        self.media.release();
        self.track_states.send_modify(|states| {
            states.local = TrackState {
                video_enabled: false,
                audio_enabled: false,
            };
            states.remote.clear();
        });

        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }
    }
}

async fn next_transport_event(subscription: &mut Option<Subscription>) -> Option<TransportEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn close_link(peer: &PeerId, mut link: Box<dyn PeerLink>) {
    if let Err(e) = link.close().await {
        warn!(target: "mesh.orchestrator", remote = %peer, error = %e, "Link close failed");
    }
}
