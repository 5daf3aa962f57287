//! Send, list and heartbeat handlers.

use super::{parse_room, require_caller};
use crate::errors::SignalError;
use crate::routes::AppState;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use signal_protocol::{PeerId, SignalId, SignalPayload, SignalingMessage};
use std::sync::Arc;
use tracing::instrument;

/// Body of `POST /v1/rooms/{room}/signals`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSignalRequest {
    /// Recipient; `null` or absent broadcasts to the room.
    #[serde(default)]
    pub to_peer_id: Option<PeerId>,
    pub message: SignalPayload,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SendSignalResponse {
    pub id: SignalId,
}

#[derive(Debug, Deserialize)]
pub struct ListSignalsQuery {
    #[serde(default)]
    pub since: i64,
}

/// `POST /v1/rooms/{room}/signals`
///
/// Returns `201 {"id": ...}`.
#[instrument(skip_all, name = "signal.http.send")]
pub async fn send_signal(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SendSignalResponse>), SignalError> {
    let caller = require_caller(&headers)?;
    let room = parse_room(room)?;
    let request: SendSignalRequest = serde_json::from_slice(&body)
        .map_err(|e| SignalError::InvalidSignalPayload(e.to_string()))?;

    let id = state
        .service
        .send(Some(&caller), &room, request.to_peer_id, request.message)
        .await?;

    Ok((StatusCode::CREATED, Json(SendSignalResponse { id })))
}

/// `GET /v1/rooms/{room}/signals?since=<ms>`
#[instrument(skip_all, name = "signal.http.list")]
pub async fn list_signals(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    query: Result<Query<ListSignalsQuery>, QueryRejection>,
) -> Result<Json<Vec<SignalingMessage>>, SignalError> {
    let caller = require_caller(&headers)?;
    let room = parse_room(room)?;
    let Query(query) = query.map_err(|e| SignalError::InvalidRequest(e.body_text()))?;

    let messages = state.service.list(Some(&caller), &room, query.since).await?;
    Ok(Json(messages))
}

/// `POST /v1/rooms/{room}/heartbeat`
///
/// Presence glue for deployments without an external presence service.
#[instrument(skip_all, name = "signal.http.heartbeat")]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, SignalError> {
    let caller = require_caller(&headers)?;
    let room = parse_room(room)?;
    state.service.heartbeat(Some(&caller), &room).await?;
    Ok(StatusCode::NO_CONTENT)
}
