//! End-to-end: a charge point over a real WebSocket, operators over the
//! control API router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use csms_core::{Call, CallResult, ConnectionRegistry, OcppMessage};
use csms_server::{control, BoundCentralSystem, CentralSystem, ServerConfig, OCPP_SUBPROTOCOL};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    // Idle clients in these tests never read, so they never answer pings
    ServerConfig::default()
        .with_ws_bind("127.0.0.1:0".parse().unwrap())
        .with_http_bind("127.0.0.1:0".parse().unwrap())
        .with_call_timeout(Duration::from_millis(300))
        .with_ping_interval(Duration::from_secs(60))
}

async fn start() -> (String, Arc<ConnectionRegistry>, CancellationToken) {
    start_with(test_config()).await
}

async fn start_with(config: ServerConfig) -> (String, Arc<ConnectionRegistry>, CancellationToken) {
    let bound: BoundCentralSystem = CentralSystem::new(config).bind().await.unwrap();
    let ws_url = format!("ws://{}", bound.ws_addr().unwrap());
    let registry = bound.registry().clone();
    let shutdown = bound.shutdown_token();
    tokio::spawn(bound.run());

    (ws_url, registry, shutdown)
}

async fn connect(base: &str, identity: &str) -> Client {
    let mut request = format!("{}/ws/ocpp/{}/", base, identity)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

    let (client, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
        OCPP_SUBPROTOCOL
    );
    client
}

async fn next_envelope(client: &mut Client) -> OcppMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")
            .expect("stream ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => return OcppMessage::parse(text.as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame {:?}", other),
        }
    }
}

async fn send(client: &mut Client, msg: OcppMessage) {
    client.send(Message::Text(msg.to_text().unwrap())).await.unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn post(registry: &Arc<ConnectionRegistry>, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();

    let resp = control::router(registry.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn charge_point_boot_is_answered() {
    let (base, registry, shutdown) = start().await;
    let mut cp = connect(&base, "CP-1").await;

    let boot = Call::new(
        "boot-1",
        "BootNotification",
        json!({"chargePointModel": "EVSE-123", "chargePointVendor": "EV-Charger Inc."}),
    )
    .unwrap();
    send(&mut cp, OcppMessage::Call(boot)).await;

    match next_envelope(&mut cp).await {
        OcppMessage::CallResult(result) => {
            assert_eq!(result.message_id, "boot-1");
            assert_eq!(result.payload["status"], "Accepted");
        }
        other => panic!("Expected CallResult, got {:?}", other),
    }

    send(&mut cp, OcppMessage::Call(Call::new("x-1", "DataTransfer", json!({})).unwrap())).await;
    match next_envelope(&mut cp).await {
        OcppMessage::CallError(error) => assert_eq!(error.message_id, "x-1"),
        other => panic!("Expected CallError, got {:?}", other),
    }

    eventually(|| registry.lookup("CP-1").is_some()).await;
    shutdown.cancel();
}

#[tokio::test]
async fn operator_commands_reach_the_charge_point() {
    let (base, registry, shutdown) = start().await;
    let mut cp = connect(&base, "CP-1").await;
    eventually(|| registry.lookup("CP-1").is_some()).await;

    // The charge point answers RemoteStopTransaction
    let command = {
        let registry = registry.clone();
        tokio::spawn(async move { post(&registry, "/stop/CP-1", json!({"transaction_id": 42})).await })
    };
    let call = match next_envelope(&mut cp).await {
        OcppMessage::Call(call) => call,
        other => panic!("Expected Call, got {:?}", other),
    };
    assert_eq!(call.action, "RemoteStopTransaction");
    assert_eq!(call.payload, json!({"transactionId": 42}));
    send(
        &mut cp,
        OcppMessage::CallResult(CallResult::new(call.message_id, json!({"status": "Accepted"})).unwrap()),
    )
    .await;

    let (status, body) = command.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "device");
    assert_eq!(body["result"]["status"], "Accepted");

    // Silent on BootNotification: the fallback answers
    let (status, body) = post(&registry, "/start/CP-1", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "fallback");
    assert_eq!(body["result"]["status"], "Accepted");
    assert!(matches!(next_envelope(&mut cp).await, OcppMessage::Call(_)));

    // Unknown charger
    let (status, body) = post(&registry, "/command/CP-9/Reset", json!({"type": "Soft"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Charger not found");

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_path_is_rejected() {
    let (base, registry, shutdown) = start().await;

    match connect_async(format!("{}/somewhere/else/", base)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        Err(e) => panic!("Expected HTTP 404, got {}", e),
        Ok(_) => panic!("Handshake should have been refused"),
    }
    assert!(registry.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn reconnect_replaces_and_disconnect_unregisters() {
    let (base, registry, shutdown) = start().await;

    let mut first = connect(&base, "CP-1").await;
    eventually(|| registry.lookup("CP-1").is_some()).await;
    let first_session = registry.lookup("CP-1").unwrap();

    let second = connect(&base, "CP-1").await;
    eventually(|| {
        registry
            .lookup("CP-1")
            .map(|s| !Arc::ptr_eq(&s, &first_session))
            .unwrap_or(false)
    })
    .await;
    assert!(first_session.is_closed());

    // The replaced connection is closed by the server
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // The stale connection going away leaves the replacement in place
    drop(first);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.identities(), vec!["CP-1"]);

    drop(second);
    eventually(|| registry.is_empty()).await;

    shutdown.cancel();
}

#[tokio::test]
async fn dropped_charge_point_fails_outstanding_command() {
    // Long enough that a timeout cannot pass for the disconnect
    let (base, registry, shutdown) =
        start_with(test_config().with_call_timeout(Duration::from_secs(30))).await;
    let mut cp = connect(&base, "CP-1").await;
    eventually(|| registry.lookup("CP-1").is_some()).await;

    let command = {
        let registry = registry.clone();
        tokio::spawn(async move { post(&registry, "/command/CP-1/Reset", json!({"type": "Hard"})).await })
    };
    match next_envelope(&mut cp).await {
        OcppMessage::Call(call) => assert_eq!(call.action, "Reset"),
        other => panic!("Expected Call, got {:?}", other),
    }
    drop(cp);

    let (status, body) = timeout(Duration::from_secs(5), command)
        .await
        .expect("command still waiting after disconnect")
        .unwrap();
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "ConnectionClosed");
    eventually(|| registry.is_empty()).await;

    shutdown.cancel();
}

#[tokio::test]
async fn silent_connection_is_dropped_after_missed_pings() {
    let (base, registry, shutdown) =
        start_with(test_config().with_ping_interval(Duration::from_millis(100))).await;

    // Never reads, so pings go unanswered
    let _silent = connect(&base, "CP-SILENT").await;

    // Reading answers every ping with a pong
    let mut alive = connect(&base, "CP-ALIVE").await;
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = alive.next().await {} });

    eventually(|| registry.lookup("CP-SILENT").is_none() && registry.lookup("CP-ALIVE").is_some()).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.identities(), vec!["CP-ALIVE"]);

    reader.abort();
    shutdown.cancel();
}

#[tokio::test]
async fn shutdown_closes_connected_charge_points() {
    let (base, registry, shutdown) = start().await;
    let mut cp = connect(&base, "CP-1").await;
    eventually(|| registry.lookup("CP-1").is_some()).await;
    let session = registry.lookup("CP-1").unwrap();

    shutdown.cancel();

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match cp.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(session.is_closed());
    eventually(|| registry.is_empty()).await;
}
