//! Push fan-out of newly stored signals.
//!
//! Every stored signal is published once; each open stream filters by room
//! and addressing. Delivery is at-most-once: a subscriber that falls more
//! than `capacity` messages behind skips the overflow and keeps going.

use signal_protocol::SignalingMessage;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct SignalHub {
    sender: broadcast::Sender<Arc<SignalingMessage>>,
}

impl SignalHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a stored signal. Returns the number of subscribers reached.
    pub fn publish(&self, message: Arc<SignalingMessage>) -> usize {
        // No subscribers is not an error: nobody is streaming right now.
        self.sender.send(message).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SignalingMessage>> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
