// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Full-stack tests: daemon + hub on a real port, driven by a real
//! WebSocket client. No API key and no MCP servers are configured, so
//! everything exercised here must work offline.

use bosun::Daemon;
use bosun_config::Paths;
use bosun_node::{Envelope, Hub};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Rig {
    _tmp: tempfile::TempDir,
    ws: ClientWs,
}

async fn start() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(Paths::at(tmp.path())).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Hub::router(daemon.hub())).await.unwrap();
    });

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    Rig { _tmp: tmp, ws }
}

impl Rig {
    async fn send(&mut self, envelope: Envelope) {
        let text = serde_json::to_string(&envelope).unwrap();
        self.ws.send(WsMessage::Text(text)).await.unwrap();
    }

    /// Receive envelopes until one of `kind` arrives, skipping others.
    async fn recv_kind(&mut self, kind: &str) -> Envelope {
        let deadline = std::time::Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout(deadline, self.ws.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                if envelope.kind == kind {
                    return envelope;
                }
            }
        }
    }
}

#[tokio::test]
async fn status_envelope_reports_daemon_state() {
    let mut rig = start().await;
    let status = rig.recv_kind("status").await;
    assert_eq!(status.metadata["connected"], true);
    assert_eq!(status.metadata["toolCount"], 0);
    assert!(status.metadata["hasApiKey"].is_boolean());
    assert!(status.metadata["daemonVersion"].is_string());
}

#[tokio::test]
async fn parse_schedule_validates_cron_expressions() {
    let mut rig = start().await;
    rig.recv_kind("status").await;

    rig.send(Envelope::new("parse_schedule").with_content("*/5 * * * *"))
        .await;
    let ok = rig.recv_kind("parse_schedule_result").await;
    assert_eq!(ok.metadata["valid"], true);
    assert_eq!(ok.metadata["nextFires"].as_array().unwrap().len(), 3);
    assert!(ok.metadata["description"]
        .as_str()
        .unwrap()
        .contains("minute: */5"));

    rig.send(Envelope::new("parse_schedule").with_content("61 * * * *"))
        .await;
    let bad = rig.recv_kind("parse_schedule_result").await;
    assert_eq!(bad.metadata["valid"], false);
    assert!(!bad.metadata["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn workflow_lifecycle_over_the_wire() {
    let mut rig = start().await;
    rig.recv_kind("status").await;

    // Create a zero-step workflow (no MCP needed to run it).
    rig.send(Envelope::new("create_workflow").with_content(
        r#"{"name": "noop", "trigger": {"type": "cron", "expression": "0 9 * * *"}}"#,
    ))
    .await;
    let created = rig.recv_kind("workflow_created").await;
    let workflow_id = created.id.clone().unwrap();

    // It shows up in the list with no execution yet.
    rig.send(Envelope::new("list_workflows")).await;
    let list = rig.recv_kind("workflow_list").await;
    let items: serde_json::Value =
        serde_json::from_str(list.content.as_deref().unwrap()).unwrap();
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["name"], "noop");
    assert!(items[0].get("latestExecution").is_none());

    // Run it and watch the lifecycle broadcasts.
    rig.send(Envelope::new("run_workflow").with_id(&workflow_id))
        .await;
    let started = rig.recv_kind("workflow_execution_started").await;
    assert_eq!(started.metadata["workflowId"], workflow_id.as_str());
    let done = rig.recv_kind("workflow_execution_done").await;
    assert_eq!(done.metadata["status"], "completed");
    let notification = rig.recv_kind("workflow_notification").await;
    assert_eq!(notification.metadata["notificationType"], "completed");

    // The execution is durable and queryable.
    rig.send(Envelope::new("list_executions").with_id(&workflow_id))
        .await;
    let executions = rig.recv_kind("execution_list").await;
    let records: serde_json::Value =
        serde_json::from_str(executions.content.as_deref().unwrap()).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["status"], "completed");
    assert_eq!(records[0]["triggerInfo"], "manual");
    assert!(records[0]["completedAt"].is_string());

    // Delete and confirm.
    rig.send(Envelope::new("delete_workflow").with_id(&workflow_id))
        .await;
    rig.recv_kind("workflow_deleted").await;
    rig.send(Envelope::new("list_workflows")).await;
    let list = rig.recv_kind("workflow_list").await;
    assert_eq!(list.content.as_deref(), Some("[]"));
}

#[tokio::test]
async fn conversation_lifecycle_over_the_wire() {
    let mut rig = start().await;
    rig.recv_kind("status").await;

    rig.send(Envelope::new("new_conversation")).await;
    let created = rig.recv_kind("conversation_created").await;
    let id = created.conversation_id.clone().unwrap();

    rig.send(Envelope::new("list_conversations")).await;
    let list = rig.recv_kind("conversation_list").await;
    let items: serde_json::Value =
        serde_json::from_str(list.content.as_deref().unwrap()).unwrap();
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["id"], id.as_str());
    assert_eq!(items[0]["messageCount"], 0);

    rig.send(Envelope::new("load_conversation").with_conversation(&id))
        .await;
    let loaded = rig.recv_kind("conversation_loaded").await;
    let conversation: serde_json::Value =
        serde_json::from_str(loaded.content.as_deref().unwrap()).unwrap();
    assert_eq!(conversation["id"], id.as_str());

    rig.send(Envelope::new("delete_conversation").with_conversation(&id))
        .await;
    rig.recv_kind("conversation_deleted").await;
}

#[tokio::test]
async fn chat_without_an_api_key_fails_cleanly() {
    // Only meaningful when the host environment has no key configured.
    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        return;
    }
    let mut rig = start().await;
    rig.recv_kind("status").await;

    rig.send(
        Envelope::new("user_message")
            .with_conversation("c-1")
            .with_content("hello"),
    )
    .await;
    let err = rig.recv_kind("error").await;
    assert_eq!(err.metadata["code"], "NO_API_KEY");
}

#[tokio::test]
async fn unknown_message_types_are_rejected() {
    let mut rig = start().await;
    rig.recv_kind("status").await;

    rig.send(Envelope::new("do_the_thing")).await;
    let err = rig.recv_kind("error").await;
    assert_eq!(err.metadata["code"], "INVALID_MESSAGE");
}
