//! Push stream delivery.
//!
//! One long-lived stream per subscription. The server forwards each newly
//! stored signal as a versioned envelope; nothing is replayed after a
//! reconnect. Unexpected closes are retried with exponential backoff until
//! the attempt budget runs out, then `TransportExhausted` ends the
//! subscription.

use super::{DeliveryFilter, SignalTransport, Subscription, TransportEvent};
use crate::api::http::{parse_base_url, room_endpoint, PEER_ID_HEADER};
use crate::config::TransportKind;
use crate::errors::MeshError;
use crate::observability::metrics;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use signal_protocol::{decode_envelope, PeerId, RoomId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Text frames from an open stream. Ends when the server closes it.
pub type FrameStream = BoxStream<'static, Result<String, MeshError>>;

/// Opens push streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, room: &RoomId, local: &PeerId) -> Result<FrameStream, MeshError>;
}

/// Reconnect delays: `min(base * 2^attempt, max)` for at most `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(16_000), 5)
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// WebSocket connector for `{base}/v1/rooms/{room}/stream`.
#[derive(Debug, Clone)]
pub struct WsStreamConnector {
    base_url: Url,
}

impl WsStreamConnector {
    /// Derive the stream URL from the store base URL (`http` → `ws`, `https` → `wss`).
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` for an invalid URL or unsupported scheme.
    pub fn new(base_url: &str) -> Result<Self, MeshError> {
        let mut url = parse_base_url(base_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(MeshError::Config(format!(
                    "unsupported signal URL scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| MeshError::Config(format!("cannot use scheme '{scheme}' for {base_url}")))?;
        Ok(Self { base_url: url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl StreamConnector for WsStreamConnector {
    async fn connect(&self, room: &RoomId, local: &PeerId) -> Result<FrameStream, MeshError> {
        let url = room_endpoint(&self.base_url, room, "stream")?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| MeshError::Config(format!("invalid stream request: {e}")))?;
        let identity = HeaderValue::from_str(local.as_str())
            .map_err(|e| MeshError::Config(format!("peer id is not a valid header: {e}")))?;
        request.headers_mut().insert(PEER_ID_HEADER, identity);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| MeshError::TransportDisconnected(e.to_string()))?;

        let frames = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(MeshError::TransportDisconnected(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Push stream strategy.
pub struct PushStreamTransport {
    connector: Arc<dyn StreamConnector>,
    backoff: BackoffPolicy,
    dedup_capacity: usize,
}

impl PushStreamTransport {
    #[must_use]
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        backoff: BackoffPolicy,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            connector,
            backoff,
            dedup_capacity,
        }
    }
}

impl SignalTransport for PushStreamTransport {
    fn subscribe(&self, room: &RoomId, local: &PeerId) -> Subscription {
        let connector = Arc::clone(&self.connector);
        let backoff = self.backoff;
        let filter = DeliveryFilter::new(room.clone(), local.clone(), self.dedup_capacity);
        let room = room.clone();
        let local = local.clone();

        Subscription::spawn(CancellationToken::new(), move |events, cancel| {
            run_push(connector, backoff, filter, room, local, events, cancel)
        })
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }
}

/// How a stream stopped.
enum StreamEnd {
    /// Server closed it or it errored.
    Closed(String),
    /// Subscription cancelled or its listener went away.
    Stopped,
}

#[instrument(skip_all, name = "mesh.transport.push", fields(room_id = %room, peer_id = %local))]
pub(crate) async fn run_push(
    connector: Arc<dyn StreamConnector>,
    backoff: BackoffPolicy,
    mut filter: DeliveryFilter,
    room: RoomId,
    local: PeerId,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    // Consecutive reconnects since the last successful open.
    let mut attempt: u32 = 0;
    let mut first_connect = true;

    loop {
        if !first_connect {
            if attempt >= backoff.max_attempts() {
                error!(
                    target: "mesh.transport.push",
                    attempts = attempt,
                    "Push stream reconnect budget exhausted"
                );
                let _ = events
                    .send(TransportEvent::Error(MeshError::TransportExhausted(attempt)))
                    .await;
                return;
            }

            let delay = backoff.delay(attempt);
            attempt += 1;
            metrics::record_transport_reconnect();
            info!(
                target: "mesh.transport.push",
                attempt = attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting push stream"
            );
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
        first_connect = false;

        let connected = tokio::select! {
            () = cancel.cancelled() => return,
            result = connector.connect(&room, &local) => result,
        };

        let reason = match connected {
            Ok(stream) => {
                attempt = 0;
                info!(target: "mesh.transport.push", "Push stream open");
                match pump(stream, &mut filter, &events, &cancel).await {
                    StreamEnd::Closed(reason) => reason,
                    StreamEnd::Stopped => return,
                }
            }
            Err(e) => e.to_string(),
        };

        warn!(target: "mesh.transport.push", reason = %reason, "Push stream lost");
        if events
            .send(TransportEvent::Error(MeshError::TransportDisconnected(reason)))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn pump(
    mut stream: FrameStream,
    filter: &mut DeliveryFilter,
    events: &mpsc::Sender<TransportEvent>,
    cancel: &CancellationToken,
) -> StreamEnd {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return StreamEnd::Stopped,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(text)) => match decode_envelope(&text) {
                Ok(message) => {
                    if filter.admit(&message)
                        && events.send(TransportEvent::Message(message)).await.is_err()
                    {
                        return StreamEnd::Stopped;
                    }
                }
                Err(e) => {
                    warn!(target: "mesh.transport.push", error = %e, "Dropping malformed envelope");
                    metrics::record_signal_dropped("malformed");
                }
            },
            Some(Err(e)) => return StreamEnd::Closed(e.to_string()),
            None => return StreamEnd::Closed("stream closed by server".to_string()),
        }
    }
}
