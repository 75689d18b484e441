// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Integration tests running the hub on a real listener with real
//! WebSocket clients.

use std::sync::Arc;

use async_trait::async_trait;
use bosun_node::{Envelope, EventSink, Hub, MessageHandler};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct EchoHandler {
    hub: Arc<Hub>,
    seen: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_connect(&self, client_id: u64) {
        let status = Envelope::new("status").with_meta("connected", true);
        self.hub.send_to(client_id, &status).await;
    }

    async fn on_message(&self, client_id: u64, envelope: Envelope) {
        self.seen.lock().await.push(envelope.clone());
        let reply = Envelope::new("echo").with_content(envelope.kind);
        self.hub.send_to(client_id, &reply).await;
    }
}

async fn start_hub() -> (Arc<Hub>, Arc<EchoHandler>, String) {
    let hub = Hub::new();
    let handler = Arc::new(EchoHandler {
        hub: Arc::clone(&hub),
        seen: Mutex::new(Vec::new()),
    });
    hub.set_handler(handler.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Hub::router(Arc::clone(&hub));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (hub, handler, format!("ws://{addr}/ws"))
}

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn recv_envelope(ws: &mut ClientWs) -> Envelope {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn status_envelope_arrives_on_connect() {
    let (_hub, _handler, url) = start_hub().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let status = recv_envelope(&mut ws).await;
    assert_eq!(status.kind, "status");
    assert_eq!(status.metadata["connected"], true);
}

#[tokio::test]
async fn ping_is_answered_with_pong_at_the_protocol_layer() {
    let (_hub, handler, url) = start_hub().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _status = recv_envelope(&mut ws).await;

    ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let pong = recv_envelope(&mut ws).await;
    assert_eq!(pong.kind, "pong");
    // Keepalives never reach the handler.
    assert!(handler.seen.lock().await.is_empty());
}

#[tokio::test]
async fn malformed_envelope_yields_invalid_message_error() {
    let (_hub, _handler, url) = start_hub().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _status = recv_envelope(&mut ws).await;

    ws.send(WsMessage::Text("{not valid".into())).await.unwrap();
    let err = recv_envelope(&mut ws).await;
    assert_eq!(err.kind, "error");
    assert_eq!(err.metadata["code"], "INVALID_MESSAGE");
}

#[tokio::test]
async fn messages_are_dispatched_to_the_handler() {
    let (_hub, handler, url) = start_hub().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _status = recv_envelope(&mut ws).await;

    ws.send(WsMessage::Text(
        r#"{"type":"list_conversations"}"#.into(),
    ))
    .await
    .unwrap();
    let echo = recv_envelope(&mut ws).await;
    assert_eq!(echo.kind, "echo");
    assert_eq!(echo.content.as_deref(), Some("list_conversations"));
    assert_eq!(handler.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn broadcast_reaches_every_connected_client() {
    let (hub, _handler, url) = start_hub().await;
    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _ = recv_envelope(&mut a).await;
    let _ = recv_envelope(&mut b).await;

    hub.broadcast(Envelope::new("assistant_chunk").with_content("hi"))
        .await;
    assert_eq!(recv_envelope(&mut a).await.kind, "assistant_chunk");
    assert_eq!(recv_envelope(&mut b).await.kind, "assistant_chunk");
}

#[tokio::test]
async fn concurrently_stalled_clients_cost_one_timeout_window() {
    use std::time::{Duration, Instant};

    // Short send timeout so saturated clients fail fast in the test.
    let send_timeout = Duration::from_millis(500);
    let hub = Hub::with_send_timeout(send_timeout);
    let handler = Arc::new(EchoHandler {
        hub: Arc::clone(&hub),
        seen: Mutex::new(Vec::new()),
    });
    hub.set_handler(handler);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Hub::router(Arc::clone(&hub));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let url = format!("ws://{addr}/ws");

    // Three clients that never read: their socket buffers fill up and stay
    // full. They receive identical bytes, so they saturate together.
    let mut stalled = Vec::new();
    for _ in 0..3 {
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        stalled.push(ws);
    }

    // One healthy client that drains continuously and reports what it saw.
    let (mut healthy, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (kinds_tx, mut kinds_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(msg)) = healthy.next().await {
            if let WsMessage::Text(text) = msg {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                let _ = kinds_tx.send(envelope.kind);
            }
        }
    });
    assert_eq!(kinds_rx.recv().await.as_deref(), Some("status"));

    // Saturate the stalled clients with large payloads until their sends
    // time out and they are dropped. The slowest single broadcast must
    // stay near ONE timeout window even with three clients timing out in
    // it; sequential sends would stack to three.
    let payload = "x".repeat(256 * 1024);
    let mut slowest = Duration::ZERO;
    for _ in 0..128 {
        let started = Instant::now();
        hub.broadcast(Envelope::new("filler").with_content(payload.clone()))
            .await;
        slowest = slowest.max(started.elapsed());
        if hub.client_count().await == 1 {
            break;
        }
    }
    assert_eq!(hub.client_count().await, 1, "stalled clients must be dropped");
    assert!(
        slowest < send_timeout * 2,
        "slowest broadcast took {slowest:?} with a {send_timeout:?} send timeout"
    );

    // Broadcasts keep flowing to the healthy client afterwards.
    hub.broadcast(Envelope::new("probe")).await;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), kinds_rx.recv()).await {
            Ok(Some(kind)) if kind == "probe" => break,
            Ok(Some(_)) => continue,
            _ => panic!("healthy client never received the probe"),
        }
    }
}

#[tokio::test]
async fn a_departed_client_does_not_break_broadcasts() {
    let (hub, _handler, url) = start_hub().await;
    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (b_ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let _ = recv_envelope(&mut a).await;
    drop(b_ws); // abrupt disconnect

    // Give the hub a beat to notice the closed socket.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    hub.broadcast(Envelope::new("workflow_notification")).await;
    assert_eq!(recv_envelope(&mut a).await.kind, "workflow_notification");
    assert_eq!(hub.client_count().await, 1);
}
