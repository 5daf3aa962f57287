//! Watermark pull delivery.
//!
//! Each cycle lists signals created after the watermark, delivers the new
//! ones and moves the watermark to `max(createdAt) - overlap`. The overlap
//! re-reads a short window on every cycle so late-persisted signals are not
//! skipped; the dedup window hides the re-reads from listeners. Skew beyond
//! the overlap can still lose a signal.

use super::{DeliveryFilter, SignalTransport, Subscription, TransportEvent};
use crate::api::SignalApi;
use crate::config::{
    TransportKind, DEFAULT_DEDUP_CAPACITY, DEFAULT_POLL_INTERVAL_MS, DEFAULT_WATERMARK_OVERLAP_MS,
};
use signal_protocol::{PeerId, RoomId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Watermark pull settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullConfig {
    pub poll_interval: Duration,
    pub overlap_ms: i64,
    pub dedup_capacity: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            overlap_ms: DEFAULT_WATERMARK_OVERLAP_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Next watermark after processing a batch whose newest record is `max_created_at`.
///
/// Never moves backwards.
#[must_use]
pub fn advance_watermark(current: i64, max_created_at: i64, overlap_ms: i64) -> i64 {
    current.max(max_created_at.saturating_sub(overlap_ms))
}

/// Polling strategy over [`SignalApi::list_signals`].
pub struct WatermarkPullTransport {
    api: Arc<dyn SignalApi>,
    config: PullConfig,
}

impl WatermarkPullTransport {
    #[must_use]
    pub fn new(api: Arc<dyn SignalApi>, config: PullConfig) -> Self {
        Self { api, config }
    }
}

impl SignalTransport for WatermarkPullTransport {
    fn subscribe(&self, room: &RoomId, local: &PeerId) -> Subscription {
        let api = Arc::clone(&self.api);
        let config = self.config;
        let filter = DeliveryFilter::new(room.clone(), local.clone(), config.dedup_capacity);
        let room = room.clone();

        Subscription::spawn(CancellationToken::new(), move |events, cancel| {
            run_pull(api, config, filter, room, events, cancel)
        })
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pull
    }
}

#[instrument(skip_all, name = "mesh.transport.pull", fields(room_id = %room))]
pub(crate) async fn run_pull(
    api: Arc<dyn SignalApi>,
    config: PullConfig,
    mut filter: DeliveryFilter,
    room: RoomId,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut since: i64 = 0;
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target: "mesh.transport.pull", watermark = since, "Pull stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let batch = tokio::select! {
            () = cancel.cancelled() => return,
            result = api.list_signals(&room, since) => result,
        };

        match batch {
            Ok(messages) => {
                let newest = messages.iter().map(|m| m.created_at).max();
                for message in messages {
                    if filter.admit(&message)
                        && events.send(TransportEvent::Message(message)).await.is_err()
                    {
                        return;
                    }
                }
                if let Some(newest) = newest {
                    since = advance_watermark(since, newest, config.overlap_ms);
                }
            }
            Err(e) => {
                warn!(target: "mesh.transport.pull", error = %e, watermark = since, "List failed");
                if events.send(TransportEvent::Error(e)).await.is_err() {
                    return;
                }
            }
        }
    }
}
