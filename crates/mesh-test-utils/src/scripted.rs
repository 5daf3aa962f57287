//! Hand-fed signal transport.

use mesh_client::transport::{SignalTransport, Subscription, TransportEvent};
use mesh_client::{MeshError, TransportKind};
use signal_protocol::{PeerId, RoomId, SignalingMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// [`SignalTransport`] whose events are pushed by the test.
///
/// Nothing is filtered: whatever is delivered reaches every open
/// subscription in order.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `message` to every open subscription. Returns how many got it.
    pub fn deliver(&self, message: SignalingMessage) -> usize {
        self.push(TransportEvent::Message(message))
    }

    /// Report a transport error to every open subscription.
    pub fn fail(&self, error: MeshError) -> usize {
        self.push(TransportEvent::Error(error))
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }

    fn push(&self, event: TransportEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| s.send(event.clone()).is_ok());
        subscribers.len()
    }
}

impl SignalTransport for ChannelTransport {
    fn subscribe(&self, _room: &RoomId, _local: &PeerId) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);

        Subscription::spawn(CancellationToken::new(), move |events, cancel| async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }
}
