//! Integration tests for the signal HTTP/WebSocket API.
//!
//! Requests go through the real router via `tower::ServiceExt::oneshot`; the
//! push stream test binds a loopback listener and connects with a WebSocket
//! client.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use signal_protocol::decode_envelope;
use signal_service::clock::ManualClock;
use signal_service::hub::SignalHub;
use signal_service::presence::InMemoryPresence;
use signal_service::routes::{build_routes, AppState};
use signal_service::store::{MemorySignalRepository, SignalService};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

const T0: i64 = 1_700_000_000_000;

struct TestApp {
    router: Router,
    service: SignalService,
    repository: Arc<MemorySignalRepository>,
    clock: Arc<ManualClock>,
}

fn test_app() -> TestApp {
    let clock = Arc::new(ManualClock::new(T0));
    let repository = Arc::new(MemorySignalRepository::new());
    let presence = Arc::new(InMemoryPresence::new(clock.clone(), 30_000));
    let service = SignalService::new(
        repository.clone(),
        presence,
        SignalHub::new(64),
        clock.clone(),
        60_000,
    );
    let router = build_routes(Arc::new(AppState {
        service: service.clone(),
    }));
    TestApp {
        router,
        service,
        repository,
        clock,
    }
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    peer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    use tower::ServiceExt;

    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(peer) = peer {
        builder = builder.header("x-peer-id", peer);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn join(app: &TestApp, peers: &[&str]) {
    for peer in peers {
        let (status, _) = call(
            &app.router,
            "POST",
            "/v1/rooms/ABC123/heartbeat",
            Some(peer),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

fn offer_to(to: Option<&str>) -> Value {
    json!({ "toPeerId": to, "message": { "type": "offer", "payload": { "sdp": "v=0\r\n" } } })
}

#[tokio::test]
async fn test_send_and_list_direct_offer() {
    let app = test_app();
    join(&app, &["A", "B", "C"]).await;

    let (status, body) = call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("A"),
        Some(offer_to(Some("B"))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["id"].is_string());

    let (status, for_b) = call(&app.router, "GET", "/v1/rooms/ABC123/signals?since=0", Some("B"), None).await;
    assert_eq!(status, StatusCode::OK);
    let for_b = for_b.as_array().unwrap();
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_b[0]["fromPeerId"], "A");
    assert_eq!(for_b[0]["toPeerId"], "B");
    assert_eq!(for_b[0]["message"]["type"], "offer");
    assert_eq!(for_b[0]["id"], body["id"]);

    let (_, for_a) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", Some("A"), None).await;
    assert!(for_a.as_array().unwrap().is_empty());
    let (_, for_c) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", Some("C"), None).await;
    assert!(for_c.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_identity_is_auth_required() {
    let app = test_app();
    let (status, body) = call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        None,
        Some(offer_to(None)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_REQUIRED");

    let (status, _) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_non_member_is_rejected() {
    let app = test_app();
    join(&app, &["A"]).await;

    let (status, body) = call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("Z"),
        Some(offer_to(Some("A"))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "NOT_ACTIVE_MEMBER");
    assert!(app.repository.is_empty().await);
}

#[tokio::test]
async fn test_self_addressed_candidate_is_rejected() {
    let app = test_app();
    join(&app, &["A"]).await;

    let (status, body) = call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("A"),
        Some(json!({
            "toPeerId": "A",
            "message": { "type": "ice-candidate", "payload": { "candidate": "candidate:1", "sdpMid": "0" } }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SELF_ADDRESSED_SIGNAL");
    assert!(app.repository.is_empty().await);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let app = test_app();
    join(&app, &["A", "B"]).await;

    for payload in [
        json!({ "toPeerId": "B", "message": { "type": "offer", "payload": { "sdp": "" } } }),
        json!({ "toPeerId": "B", "message": { "type": "ice-candidate", "payload": { "candidate": "c" } } }),
        json!({ "toPeerId": "B", "message": { "type": "hangup", "payload": {} } }),
        json!({ "toPeerId": "", "message": { "type": "offer", "payload": { "sdp": "v=0" } } }),
    ] {
        let (status, body) = call(
            &app.router,
            "POST",
            "/v1/rooms/ABC123/signals",
            Some("A"),
            Some(payload),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_SIGNAL_PAYLOAD");
    }
    assert!(app.repository.is_empty().await);
}

#[tokio::test]
async fn test_invalid_since_is_bad_request() {
    let app = test_app();
    join(&app, &["B"]).await;
    let (status, body) = call(
        &app.router,
        "GET",
        "/v1/rooms/ABC123/signals?since=yesterday",
        Some("B"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_signal_expires_after_ttl() {
    let app = test_app();
    join(&app, &["A", "B"]).await;
    call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("A"),
        Some(offer_to(None)),
    )
    .await;

    // Keep B live across the TTL window.
    app.clock.advance_ms(20_000);
    join(&app, &["B"]).await;
    app.clock.advance_ms(20_000);
    join(&app, &["B"]).await;
    app.clock.advance_ms(19_000);
    join(&app, &["B"]).await;

    app.service.expire().await.unwrap();
    let (_, listed) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", Some("B"), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1, "visible at t0 + 59s");

    app.clock.advance_ms(2_000);
    assert_eq!(app.service.expire().await.unwrap(), 1);
    let (_, listed) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", Some("B"), None).await;
    assert!(listed.as_array().unwrap().is_empty(), "gone at t0 + 61s");
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn open_stream(addr: std::net::SocketAddr, peer: &str) -> WsStream {
    let mut request = format!("ws://{addr}/v1/rooms/ABC123/stream")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-peer-id", peer.parse().unwrap());
    let (stream, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream
}

async fn next_text(stream: &mut WsStream) -> Option<String> {
    match tokio::time::timeout(Duration::from_millis(300), stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        _ => None,
    }
}

#[tokio::test]
async fn test_push_stream_delivers_envelopes() {
    let app = test_app();
    join(&app, &["A", "B", "C"]).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let mut stream_a = open_stream(addr, "A").await;
    let mut stream_b = open_stream(addr, "B").await;
    let mut stream_c = open_stream(addr, "C").await;

    // Wait until all three streams are subscribed to the hub.
    for _ in 0..50 {
        if app.service.hub().subscriber_count() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("A"),
        Some(offer_to(Some("B"))),
    )
    .await;

    let text = next_text(&mut stream_b).await.expect("B should receive the offer");
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["v"], 1);
    assert_eq!(value["type"], "webrtc-signaling");
    assert_eq!(value["event"], "signaling-message");
    assert_eq!(value["data"]["from"], "A");
    assert_eq!(value["data"]["roomId"], "ABC123");
    assert_eq!(value["data"]["message"]["type"], "offer");
    assert_eq!(decode_envelope(&text).unwrap().from_peer_id.as_str(), "A");

    assert!(next_text(&mut stream_a).await.is_none(), "sender never receives its own signal");
    assert!(next_text(&mut stream_c).await.is_none(), "direct signal is not visible to C");
    assert!(next_text(&mut stream_b).await.is_none(), "delivered exactly once");
}

#[tokio::test]
async fn test_push_stream_requires_membership() {
    let app = test_app();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let mut request = format!("ws://{addr}/v1/rooms/ABC123/stream")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert("x-peer-id", "B".parse().unwrap());
    let result = tokio_tungstenite::connect_async(request).await;
    assert!(
        matches!(
            &result,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) if response.status().as_u16() == 403
        ),
        "non-member stream must be refused with 403"
    );
}

#[tokio::test]
async fn test_push_stream_closes_when_membership_lapses() {
    let app = test_app();
    join(&app, &["A", "B"]).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let mut stream_b = open_stream(addr, "B").await;
    for _ in 0..50 {
        if app.service.hub().subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // B stops heartbeating; A stays live and keeps signaling.
    app.clock.advance_ms(31_000);
    join(&app, &["A"]).await;
    let (status, _) = call(
        &app.router,
        "POST",
        "/v1/rooms/ABC123/signals",
        Some("A"),
        Some(offer_to(Some("B"))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let frame = tokio::time::timeout(Duration::from_secs(2), stream_b.next())
        .await
        .expect("stream should be closed by the server");
    match frame {
        Some(Ok(Message::Close(Some(close)))) => {
            assert_eq!(close.code, CloseCode::Policy);
        }
        other => panic!("expected a policy close, got {other:?}"),
    }

    // Polling rejects the same caller.
    let (status, body) = call(&app.router, "GET", "/v1/rooms/ABC123/signals", Some("B"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "NOT_ACTIVE_MEMBER");
}
