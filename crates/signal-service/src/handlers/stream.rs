//! WebSocket push stream.
//!
//! Each text frame is one signal envelope. Delivery is at-most-once with no
//! replay: a client that reconnects only sees signals stored afterwards.
//!
//! Membership is checked at upgrade, again before every forwarded signal and
//! on a fixed interval while idle. A caller whose presence lapsed gets a
//! policy close frame (1008).

use super::{parse_room, require_caller};
use crate::errors::SignalError;
use crate::observability::metrics;
use crate::routes::AppState;
use crate::store::SignalService;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use signal_protocol::{encode_envelope, PeerId, RoomId, SignalingMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// How often an idle stream re-checks the caller's membership.
const MEMBERSHIP_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Why a stream is being closed from the server side.
enum Eviction {
    Lapsed,
    PresenceUnavailable,
}

impl Eviction {
    fn close_frame(&self) -> CloseFrame<'static> {
        match self {
            Eviction::Lapsed => CloseFrame {
                code: close_code::POLICY,
                reason: "not an active member".into(),
            },
            Eviction::PresenceUnavailable => CloseFrame {
                code: close_code::ERROR,
                reason: "membership check failed".into(),
            },
        }
    }
}

async fn check_membership(service: &SignalService, room: &RoomId, caller: &PeerId) -> Option<Eviction> {
    match service.is_live_member(room, caller).await {
        Ok(true) => None,
        Ok(false) => Some(Eviction::Lapsed),
        Err(e) => {
            warn!(target: "signal.http", room_id = %room, peer_id = %caller, error = %e, "Membership re-check failed");
            Some(Eviction::PresenceUnavailable)
        }
    }
}

/// `GET /v1/rooms/{room}/stream`
///
/// Auth and membership are checked before the upgrade so rejected callers
/// get a regular JSON error response.
#[instrument(skip_all, name = "signal.http.stream")]
pub async fn stream_signals(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, SignalError> {
    let caller = require_caller(&headers)?;
    let room = parse_room(room)?;
    let receiver = state.service.open_stream(Some(&caller), &room).await?;

    let service = state.service.clone();
    Ok(ws.on_upgrade(move |socket| forward_signals(socket, service, room, caller, receiver)))
}

async fn forward_signals(
    socket: WebSocket,
    service: SignalService,
    room: RoomId,
    caller: PeerId,
    mut receiver: broadcast::Receiver<Arc<SignalingMessage>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    metrics::stream_opened();
    info!(target: "signal.http", room_id = %room, peer_id = %caller, "Push stream opened");

    let mut recheck = interval_at(
        Instant::now() + MEMBERSHIP_RECHECK_INTERVAL,
        MEMBERSHIP_RECHECK_INTERVAL,
    );
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut eviction = None;

    loop {
        tokio::select! {
            result = receiver.recv() => {
                match result {
                    Ok(message) => {
                        if message.room_id != room || !message.is_visible_to(&caller) {
                            continue;
                        }
                        eviction = check_membership(&service, &room, &caller).await;
                        if eviction.is_some() {
                            break;
                        }
                        let text = match encode_envelope(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(target: "signal.http", error = %e, "Failed to encode envelope");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "signal.http",
                            room_id = %room,
                            peer_id = %caller,
                            skipped = skipped,
                            "Push stream lagged, signals skipped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = recheck.tick() => {
                eviction = check_membership(&service, &room, &caller).await;
                if eviction.is_some() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    // Clients send signals over HTTP; other frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(eviction) = eviction {
        info!(target: "signal.http", room_id = %room, peer_id = %caller, "Closing push stream for caller no longer in the room");
        let _ = ws_tx.send(Message::Close(Some(eviction.close_frame()))).await;
    }

    metrics::stream_closed();
    debug!(target: "signal.http", room_id = %room, peer_id = %caller, "Push stream closed");
}
