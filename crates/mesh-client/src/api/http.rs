//! HTTP client for the signal store.

use super::SignalApi;
use crate::errors::MeshError;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use signal_protocol::{PeerId, RoomId, SignalId, SignalPayload, SignalingMessage};
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying the authenticated peer identity.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// Request timeout for store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendSignalBody<'a> {
    to_peer_id: Option<&'a PeerId>,
    message: &'a SignalPayload,
}

#[derive(Deserialize)]
struct SendSignalReply {
    id: SignalId,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// [`SignalApi`] over the store's REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpSignalApi {
    client: reqwest::Client,
    base_url: Url,
    identity: PeerId,
}

impl HttpSignalApi {
    /// Create a client for the store at `base_url`, acting as `identity`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, identity: PeerId) -> Result<Self, MeshError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeshError::Config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(client, base_url, identity)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` if the URL is invalid.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        identity: PeerId,
    ) -> Result<Self, MeshError> {
        let base_url = parse_base_url(base_url)?;
        Ok(Self {
            client,
            base_url,
            identity,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Refresh the caller's presence in `room`.
    ///
    /// # Errors
    ///
    /// Returns the store's error or `MeshError::Http` on a network failure.
    #[instrument(skip_all, name = "mesh.api.heartbeat", fields(room_id = %room))]
    pub async fn heartbeat(&self, room: &RoomId) -> Result<(), MeshError> {
        let url = room_endpoint(&self.base_url, room, "heartbeat")?;
        let response = self
            .client
            .post(url)
            .header(PEER_ID_HEADER, self.identity.as_str())
            .send()
            .await
            .map_err(|e| MeshError::Http(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

#[async_trait]
impl SignalApi for HttpSignalApi {
    fn identity(&self) -> &PeerId {
        &self.identity
    }

    #[instrument(skip_all, name = "mesh.api.send", fields(room_id = %room, kind = %payload.kind()))]
    async fn post_signal(
        &self,
        room: &RoomId,
        to: Option<&PeerId>,
        payload: &SignalPayload,
    ) -> Result<SignalId, MeshError> {
        let url = room_endpoint(&self.base_url, room, "signals")?;
        let response = self
            .client
            .post(url)
            .header(PEER_ID_HEADER, self.identity.as_str())
            .json(&SendSignalBody {
                to_peer_id: to,
                message: payload,
            })
            .send()
            .await
            .map_err(|e| MeshError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let reply: SendSignalReply = response
            .json()
            .await
            .map_err(|e| MeshError::Http(format!("invalid send response: {e}")))?;
        debug!(target: "mesh.api", signal_id = %reply.id, "Signal sent");
        Ok(reply.id)
    }

    #[instrument(skip_all, name = "mesh.api.list", fields(room_id = %room, since = since))]
    async fn list_signals(
        &self,
        room: &RoomId,
        since: i64,
    ) -> Result<Vec<SignalingMessage>, MeshError> {
        let url = room_endpoint(&self.base_url, room, "signals")?;
        let response = self
            .client
            .get(url)
            .header(PEER_ID_HEADER, self.identity.as_str())
            .query(&[("since", since)])
            .send()
            .await
            .map_err(|e| MeshError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| MeshError::Http(format!("invalid list response: {e}")))
    }
}

/// Parse a store base URL, accepting `http`, `https`, `ws` and `wss`.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, MeshError> {
    let url = Url::parse(raw)
        .map_err(|e| MeshError::Config(format!("invalid signal base URL '{raw}': {e}")))?;
    if url.cannot_be_a_base() {
        return Err(MeshError::Config(format!(
            "signal base URL '{raw}' cannot carry a path"
        )));
    }
    Ok(url)
}

/// `{base}/v1/rooms/{room}/{leaf}` with the room id percent-encoded as one segment.
pub(crate) fn room_endpoint(base: &Url, room: &RoomId, leaf: &str) -> Result<Url, MeshError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| MeshError::Config(format!("signal base URL '{base}' cannot carry a path")))?
        .pop_if_empty()
        .extend(["v1", "rooms", room.as_str(), leaf]);
    Ok(url)
}

async fn error_from_response(response: reqwest::Response) -> MeshError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => MeshError::from_store_error(&body.error.code, &body.error.message),
        Err(_) => match status {
            StatusCode::UNAUTHORIZED => MeshError::AuthRequired,
            StatusCode::FORBIDDEN => MeshError::NotActiveMember(String::new()),
            other => MeshError::Http(format!("unexpected status {other}")),
        },
    }
}
