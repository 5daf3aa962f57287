//! Signal delivery.
//!
//! Two interchangeable strategies sit behind [`SignalTransport`]:
//!
//! - [`WatermarkPullTransport`] polls `listSignals` with an advancing watermark
//!   (default)
//! - [`PushStreamTransport`] holds a long-lived stream and reconnects with
//!   exponential backoff
//!
//! Either way the subscriber sees one [`Subscription`] yielding
//! [`TransportEvent`]s. Messages authored by the local peer are never
//! delivered, and every id is delivered at most once within the
//! [`DedupWindow`].

pub mod dedup;
pub mod push;
pub mod watermark;

pub use dedup::DedupWindow;
pub use push::{BackoffPolicy, FrameStream, PushStreamTransport, StreamConnector, WsStreamConnector};
pub use watermark::{advance_watermark, PullConfig, WatermarkPullTransport};

use crate::api::SignalApi;
use crate::config::{MeshConfig, TransportKind};
use crate::errors::MeshError;
use crate::observability::metrics;
use signal_protocol::{PeerId, RoomId, SignalingMessage};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered events per subscription.
const EVENT_BUFFER: usize = 256;

/// What a subscription delivers: the `onMessage` / `onError` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(SignalingMessage),
    Error(MeshError),
}

/// A signal delivery strategy.
pub trait SignalTransport: Send + Sync {
    /// Start delivering signals for `local` in `room`.
    ///
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, room: &RoomId, local: &PeerId) -> Subscription;

    fn kind(&self) -> TransportKind;
}

/// A running delivery task and its event queue.
///
/// [`close`](Subscription::close) cancels the task, waits for it to finish
/// and discards anything still queued. Dropping the subscription cancels
/// without waiting.
pub struct Subscription {
    events: mpsc::Receiver<TransportEvent>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawn `deliver` with the sending half of a fresh event queue.
    ///
    /// `deliver` should return once its token is cancelled or the queue is
    /// closed. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(cancel_token: CancellationToken, deliver: F) -> Self
    where
        F: FnOnce(mpsc::Sender<TransportEvent>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(deliver(sender, cancel_token.clone()));
        Self {
            events,
            cancel_token,
            task: Some(task),
        }
    }

    /// Next event. `None` once the delivery task has ended.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stop delivery and wait for the task to exit.
    pub async fn close(mut self) {
        // Closing the queue first unblocks a task waiting on a full buffer.
        self.events.close();
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "mesh.transport", error = %e, "Delivery task ended abnormally");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Build the configured strategy.
///
/// # Errors
///
/// Returns `MeshError::Config` if the push stream URL cannot be derived from
/// the configured base URL.
pub fn transport_from_config(
    config: &MeshConfig,
    api: Arc<dyn SignalApi>,
) -> Result<Arc<dyn SignalTransport>, MeshError> {
    match config.transport {
        TransportKind::Pull => Ok(Arc::new(WatermarkPullTransport::new(
            api,
            config.pull_config(),
        ))),
        TransportKind::Push => {
            let connector = WsStreamConnector::new(&config.signal_base_url)?;
            Ok(Arc::new(PushStreamTransport::new(
                Arc::new(connector),
                config.backoff_policy(),
                config.dedup_capacity,
            )))
        }
    }
}

/// Per-subscription delivery rules shared by both strategies.
pub(crate) struct DeliveryFilter {
    room: RoomId,
    local: PeerId,
    dedup: DedupWindow,
}

impl DeliveryFilter {
    pub(crate) fn new(room: RoomId, local: PeerId, dedup_capacity: usize) -> Self {
        Self {
            room,
            local,
            dedup: DedupWindow::new(dedup_capacity),
        }
    }

    /// True if `message` should reach listeners. Records why it didn't otherwise.
    pub(crate) fn admit(&mut self, message: &SignalingMessage) -> bool {
        let reason = if message.from_peer_id == self.local {
            "own"
        } else if message.room_id != self.room || !message.is_visible_to(&self.local) {
            "misaddressed"
        } else if !self.dedup.insert(message.id) {
            "duplicate"
        } else {
            metrics::record_signal_received(message.kind().as_str());
            return true;
        };

        debug!(
            target: "mesh.transport",
            signal_id = %message.id,
            from = %message.from_peer_id,
            reason = reason,
            "Dropping signal"
        );
        metrics::record_signal_dropped(reason);
        false
    }
}
