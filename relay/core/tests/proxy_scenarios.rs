//! End-to-end proxy scenarios against a mock API server
//!
//! Every test wires a real [`Gateway`] (reqwest client, in-memory credential
//! store) to a wiremock server and checks what actually went over the wire.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use relay_core::messages::{
    FailureKind, GatewayMessage, RequestPayload, StreamErrorKind, StreamEvent, StreamPayload,
    SurfaceMessage,
};
use relay_core::transport::{ConnectionId, UnixSocketClient, UnixSocketServer};
use relay_core::{
    ChannelKey, CredentialSet, CredentialStore, Gateway, MemoryCredentialStore, RelayConfig,
    ReqwestClient,
};

// =============================================================================
// Harness
// =============================================================================

const SSE: &str = "text/event-stream";

struct Harness {
    gateway: Gateway,
    store: Arc<MemoryCredentialStore>,
}

fn harness(server: &MockServer, credentials: Option<CredentialSet>, idle: Duration) -> Harness {
    let store = Arc::new(match credentials {
        Some(c) => MemoryCredentialStore::with_credentials(c),
        None => MemoryCredentialStore::new(),
    });
    let mut config = RelayConfig::default();
    config.base_url = server.uri();
    config.default_idle_timeout = idle;

    let client = ReqwestClient::new(server.uri(), Duration::from_secs(5), "relay-test").unwrap();
    let gateway = Gateway::new(store.clone(), Arc::new(client), &config).unwrap();
    Harness { gateway, store }
}

fn expired_session() -> Option<CredentialSet> {
    Some(CredentialSet::bearer(
        "expired-token",
        Some("refresh-1".to_string()),
    ))
}

async fn mount_refresh(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/v1/auths/refresh"))
        .and(body_json(json!({"refresh_token": "refresh-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "refresh_token": "refresh-2",
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn authorization(request: &Request) -> Option<String> {
    request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn authorizations_for(server: &MockServer, route: &str) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == route)
        .map(authorization)
        .collect()
}

fn chat(path_: &str) -> StreamPayload {
    StreamPayload {
        request: RequestPayload {
            method: "POST".to_string(),
            body: Some(json!({"model": "m", "stream": true})),
            ..RequestPayload::new(path_)
        },
        stream_idle_timeout_ms: None,
    }
}

async fn collect_channel(rx: &mut mpsc::Receiver<GatewayMessage>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(msg) = rx.recv().await {
        if let GatewayMessage::Stream { event, .. } = msg {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    }
    events
}

// =============================================================================
// One-shot requests
// =============================================================================

#[tokio::test]
async fn expired_token_is_refreshed_and_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("authorization", "Bearer expired-token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "expired"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"secret": 42})))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, 1).await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let reply = h.gateway.handle_request(RequestPayload::new("/protected")).await;

    assert!(reply.ok, "{reply:?}");
    assert_eq!(reply.status, Some(200));
    assert_eq!(reply.data, Some(json!({"secret": 42})));
    assert_eq!(
        authorizations_for(&server, "/protected").await,
        vec![
            Some("Bearer expired-token".to_string()),
            Some("Bearer fresh-token".to_string()),
        ]
    );
    assert_eq!(
        authorizations_for(&server, "/api/v1/auths/refresh").await,
        vec![None]
    );

    let stored = h.store.get().unwrap();
    assert_eq!(stored.access_token, "fresh-token");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
    server.verify().await;
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("authorization", "Bearer expired-token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(8)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auths/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "fresh-token"}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let gateway = h.gateway.clone();
        tasks.spawn(async move { gateway.handle_request(RequestPayload::new("/protected")).await });
    }

    while let Some(reply) = tasks.join_next().await {
        assert!(reply.unwrap().ok);
    }
    assert_eq!(h.gateway.refresh().refresh_calls(), 1);
    // Refresh responses without a refresh token keep the old one.
    assert_eq!(h.store.get().unwrap().refresh_token.as_deref(), Some("refresh-1"));
    server.verify().await;
}

#[tokio::test]
async fn failed_refresh_surfaces_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auths/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "revoked"})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let reply = h.gateway.handle_request(RequestPayload::new("/protected")).await;

    assert!(!reply.ok);
    assert_eq!(reply.kind, Some(FailureKind::Authentication));
    assert_eq!(reply.status, Some(401));
    assert_eq!(h.store.get().unwrap().access_token, "expired-token");
    server.verify().await;
}

#[tokio::test]
async fn bootstrap_calls_carry_no_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auths/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new"})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let mut payload = RequestPayload::new("/api/v1/auths/signin");
    payload.method = "POST".to_string();
    payload
        .headers
        .insert("Authorization".to_string(), "Bearer injected".to_string());
    payload.body = Some(json!({"email": "a@b.c", "password": "pw"}));

    let reply = h.gateway.handle_request(payload).await;

    assert!(reply.ok);
    assert_eq!(
        authorizations_for(&server, "/api/v1/auths/signin").await,
        vec![None]
    );
    server.verify().await;
}

#[tokio::test]
async fn caller_authorization_header_is_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Some(CredentialSet::bearer("live-token", None)),
        Duration::from_secs(5),
    );
    let mut payload = RequestPayload::new("/api/models");
    payload
        .headers
        .insert("authorization".to_string(), "Bearer forged".to_string());

    let reply = h.gateway.handle_request(payload).await;

    assert_eq!(reply.data, Some(json!("plain text")));
    assert_eq!(
        authorizations_for(&server, "/api/models").await,
        vec![Some("Bearer live-token".to_string())]
    );
}

#[tokio::test]
async fn http_errors_are_reported_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not found"})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let reply = h.gateway.handle_request(RequestPayload::new("/missing")).await;

    assert!(!reply.ok);
    assert_eq!(reply.kind, Some(FailureKind::Http));
    assert_eq!(reply.status, Some(404));
    assert_eq!(reply.error.as_deref(), Some("Not found"));
    assert_eq!(h.gateway.refresh().refresh_calls(), 0);
    server.verify().await;
}

// =============================================================================
// Streams
// =============================================================================

#[tokio::test]
async fn stream_relays_events_then_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            ": keep-alive\n\ndata: {\"delta\":\"Hel\"}\n\ndata: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n",
            SSE,
        ))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Some(CredentialSet::bearer("live-token", None)),
        Duration::from_secs(5),
    );
    let (tx, mut rx) = mpsc::channel(16);
    h.gateway
        .open_stream(ChannelKey::new(ConnectionId::new(), "chat"), chat("/api/chat"), tx)
        .await;

    assert_eq!(
        collect_channel(&mut rx).await,
        vec![
            StreamEvent::Data { payload: json!({"delta": "Hel"}) },
            StreamEvent::Data { payload: json!({"delta": "lo"}) },
            StreamEvent::done(),
        ]
    );
}

#[tokio::test]
async fn concurrent_streams_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(header("authorization", "Bearer expired-token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "expired"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("data: {\"n\":1}\n\ndata: [DONE]\n\n", SSE),
        )
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(&server, 1).await;

    let h = harness(&server, expired_session(), Duration::from_secs(5));
    let conn = ConnectionId::new();
    let (tx, mut rx) = mpsc::channel(16);
    for channel in ["left", "right"] {
        h.gateway
            .open_stream(ChannelKey::new(conn.clone(), channel), chat("/api/chat"), tx.clone())
            .await;
    }
    drop(tx);

    let mut done = Vec::new();
    while let Some(msg) = rx.recv().await {
        if let GatewayMessage::Stream { channel, event } = msg {
            if event.is_terminal() {
                assert_eq!(event, StreamEvent::done());
                done.push(channel);
            }
        }
    }
    done.sort();
    assert_eq!(done, vec!["left".to_string(), "right".to_string()]);
    assert_eq!(h.gateway.refresh().refresh_calls(), 1);
    server.verify().await;
}

#[tokio::test]
async fn silent_stream_hits_idle_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: [DONE]\n\n", SSE)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Some(CredentialSet::bearer("live-token", None)),
        Duration::from_millis(200),
    );
    let (tx, mut rx) = mpsc::channel(16);
    h.gateway
        .open_stream(ChannelKey::new(ConnectionId::new(), "chat"), chat("/api/chat"), tx)
        .await;

    let events = collect_channel(&mut rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { kind: StreamErrorKind::IdleTimeout, .. }
    ));
}

#[tokio::test]
async fn rejected_stream_reports_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "model crashed"})))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        Some(CredentialSet::bearer("live-token", None)),
        Duration::from_secs(5),
    );
    let (tx, mut rx) = mpsc::channel(16);
    h.gateway
        .open_stream(ChannelKey::new(ConnectionId::new(), "chat"), chat("/api/chat"), tx)
        .await;

    assert_eq!(
        collect_channel(&mut rx).await,
        vec![StreamEvent::error(StreamErrorKind::Http, "model crashed")]
    );
}

// =============================================================================
// Surface transport
// =============================================================================

#[tokio::test]
async fn surface_round_trip_over_unix_socket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["m1", "m2"])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("data: {\"n\":1}\n\ndata: [DONE]\n\n", SSE),
        )
        .mount(&server)
        .await;

    let h = harness(&server, None, Duration::from_secs(5));
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("relay.sock");
    let mut listener = UnixSocketServer::new(socket.clone());
    listener.listen().unwrap();

    let gateway = h.gateway.clone();
    let daemon = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        while let Some(msg) = conn.inbound.recv().await {
            gateway.dispatch(&conn.id, msg, &conn.outbound).await;
        }
        gateway.disconnect(&conn.id);
    });

    let mut client = UnixSocketClient::new(socket);
    client.connect().await.unwrap();

    let status = client.call(|id| SurfaceMessage::AuthStatus { id }).await.unwrap();
    assert_eq!(status.data.unwrap()["authenticated"], false);

    let set = client
        .call(|id| SurfaceMessage::SetCredentials {
            id,
            credentials: CredentialSet::bearer("live-token", None),
        })
        .await
        .unwrap();
    assert_eq!(set.data.unwrap()["authenticated"], true);

    let reply = client.request(RequestPayload::new("/api/models")).await.unwrap();
    assert_eq!(reply.data, Some(json!(["m1", "m2"])));

    client
        .send(SurfaceMessage::OpenStream {
            channel: "chat-1".to_string(),
            payload: chat("/api/chat"),
        })
        .await
        .unwrap();
    let mut events = Vec::new();
    loop {
        let GatewayMessage::Stream { channel, event } = client.recv().await.unwrap() else {
            continue;
        };
        assert_eq!(channel, "chat-1");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    assert_eq!(
        events,
        vec![StreamEvent::Data { payload: json!({"n": 1}) }, StreamEvent::done()]
    );
    assert_eq!(
        authorizations_for(&server, "/api/chat").await,
        vec![Some("Bearer live-token".to_string())]
    );

    client.disconnect();
    daemon.await.unwrap();
}
