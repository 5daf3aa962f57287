//! Signal store access without HTTP.

use async_trait::async_trait;
use futures::StreamExt;
use mesh_client::api::SignalApi;
use mesh_client::transport::{FrameStream, StreamConnector};
use mesh_client::MeshError;
use signal_protocol::{encode_envelope, PeerId, RoomId, SignalId, SignalPayload, SignalingMessage};
use signal_service::errors::SignalError;
use signal_service::store::SignalService;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast::error::RecvError;

/// Convert a store error the way the HTTP client would see it.
pub fn mesh_error(err: &SignalError) -> MeshError {
    MeshError::from_store_error(err.error_code(), &err.client_message())
}

/// [`SignalApi`] calling a `SignalService` directly as `identity`.
pub struct InProcessSignalApi {
    service: SignalService,
    identity: PeerId,
    posts: AtomicUsize,
}

impl InProcessSignalApi {
    pub fn new(service: SignalService, identity: PeerId) -> Self {
        Self {
            service,
            identity,
            posts: AtomicUsize::new(0),
        }
    }

    /// Number of `post_signal` calls that reached the store.
    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    /// Refresh presence in `room`.
    pub async fn heartbeat(&self, room: &RoomId) {
        self.service
            .heartbeat(Some(&self.identity), room)
            .await
            .expect("heartbeat failed");
    }
}

#[async_trait]
impl SignalApi for InProcessSignalApi {
    fn identity(&self) -> &PeerId {
        &self.identity
    }

    async fn post_signal(
        &self,
        room: &RoomId,
        to: Option<&PeerId>,
        payload: &SignalPayload,
    ) -> Result<SignalId, MeshError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.service
            .send(Some(&self.identity), room, to.cloned(), payload.clone())
            .await
            .map_err(|e| mesh_error(&e))
    }

    async fn list_signals(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, MeshError> {
        self.service
            .list(Some(&self.identity), room, since)
            .await
            .map_err(|e| mesh_error(&e))
    }
}

/// Push stream connector over the service's fan-out hub.
///
/// Applies the same room and visibility filter as the WebSocket handler and
/// yields encoded envelopes, so the client's decode path is exercised.
pub struct InProcessStreamConnector {
    service: SignalService,
}

impl InProcessStreamConnector {
    pub fn new(service: SignalService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StreamConnector for InProcessStreamConnector {
    async fn connect(&self, room: &RoomId, local: &PeerId) -> Result<FrameStream, MeshError> {
        let receiver = self
            .service
            .open_stream(Some(local), room)
            .await
            .map_err(|e| mesh_error(&e))?;
        let room = room.clone();
        let local = local.clone();

        let frames = futures::stream::unfold(receiver, move |mut receiver| {
            let room = room.clone();
            let local = local.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => {
                            if message.room_id != room || !message.is_visible_to(&local) {
                                continue;
                            }
                            let frame = encode_envelope(&message).map_err(MeshError::from);
                            return Some((frame, receiver));
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(frames.boxed())
    }
}
