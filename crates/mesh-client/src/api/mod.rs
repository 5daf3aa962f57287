//! Signal store client.
//!
//! [`SignalApi`] is the seam between the mesh client and the signal store:
//! [`HttpSignalApi`] talks to a remote store, tests plug in an in-process one.
//! Outgoing signals go through [`SignalOutbox`], which refuses self-addressed
//! and malformed signals before anything reaches the network.

pub mod http;

pub use http::HttpSignalApi;

use crate::errors::MeshError;
use async_trait::async_trait;
use signal_protocol::{PeerId, RoomId, SignalId, SignalPayload, SignalingMessage};
use std::sync::Arc;
use tracing::warn;

/// Signal store operations available to an authenticated peer.
#[async_trait]
pub trait SignalApi: Send + Sync {
    /// Authenticated identity used as `fromPeerId`.
    fn identity(&self) -> &PeerId;

    /// Store a signal. `to = None` broadcasts to every other room member.
    async fn post_signal(
        &self,
        room: &RoomId,
        to: Option<&PeerId>,
        payload: &SignalPayload,
    ) -> Result<SignalId, MeshError>;

    /// Signals visible to the caller with `createdAt > since`, ascending.
    async fn list_signals(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, MeshError>;
}

#[async_trait]
impl<T: SignalApi + ?Sized> SignalApi for Arc<T> {
    fn identity(&self) -> &PeerId {
        (**self).identity()
    }

    async fn post_signal(
        &self,
        room: &RoomId,
        to: Option<&PeerId>,
        payload: &SignalPayload,
    ) -> Result<SignalId, MeshError> {
        (**self).post_signal(room, to, payload).await
    }

    async fn list_signals(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, MeshError> {
        (**self).list_signals(room, since).await
    }
}

/// Guarded sender in front of a [`SignalApi`].
#[derive(Clone)]
pub struct SignalOutbox {
    api: Arc<dyn SignalApi>,
}

impl SignalOutbox {
    #[must_use]
    pub fn new(api: Arc<dyn SignalApi>) -> Self {
        Self { api }
    }

    /// Local peer identity.
    #[must_use]
    pub fn identity(&self) -> &PeerId {
        self.api.identity()
    }

    /// Send `payload` to `to` (or the whole room).
    ///
    /// # Errors
    ///
    /// `SelfAddressedSignal` when `to` is the local peer and
    /// `InvalidSignalPayload` for a malformed payload, both without a network
    /// call. Otherwise whatever the store returns.
    pub async fn send(
        &self,
        room: &RoomId,
        to: Option<&PeerId>,
        payload: &SignalPayload,
    ) -> Result<SignalId, MeshError> {
        if to == Some(self.api.identity()) {
            warn!(
                target: "mesh.api",
                room_id = %room,
                kind = %payload.kind(),
                "Refusing self-addressed signal"
            );
            return Err(MeshError::SelfAddressedSignal);
        }
        payload.validate()?;
        self.api.post_signal(room, to, payload).await
    }
}
