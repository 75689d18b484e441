// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket hub: client registry, per-client send, broadcast.
//!
//! Each accepted socket gets a fresh id and an unbounded receive loop; the
//! send half lives behind a per-client mutex so one send is in flight at a
//! time. Broadcast sends run concurrently over a snapshot of the client
//! set, and any client whose send times out or errors is dropped — N
//! stalled phones cost one timeout window between them, never a stall of
//! the engine or of the healthy clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::future::join_all;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;

/// Ceiling on one client send; beyond it the client is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Broadcast surface handed to the chat engine and workflow notifier.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn broadcast(&self, envelope: Envelope);
}

/// The single registered consumer of inbound envelopes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once per accepted client, before any messages.
    async fn on_connect(&self, client_id: u64);

    async fn on_message(&self, client_id: u64, envelope: Envelope);
}

struct Client {
    sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
}

pub struct Hub {
    clients: Mutex<HashMap<u64, Client>>,
    next_id: AtomicU64,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    send_timeout: Duration,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Self::with_send_timeout(SEND_TIMEOUT)
    }

    /// Like [`Hub::new`] with a custom per-send ceiling.
    pub fn with_send_timeout(send_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler: OnceLock::new(),
            send_timeout,
        })
    }

    /// Register the message handler. Must happen before the listener starts
    /// accepting; a second registration is ignored.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Router exposing the daemon's single `/ws` endpoint.
    pub fn router(hub: Arc<Hub>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(hub)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Send to one client. Returns false (and removes the client) when the
    /// send times out or errors.
    pub async fn send_to(&self, client_id: u64, envelope: &Envelope) -> bool {
        let sender = {
            let clients = self.clients.lock().await;
            match clients.get(&client_id) {
                Some(c) => Arc::clone(&c.sender),
                None => return false,
            }
        };
        if send_envelope(&sender, envelope, self.send_timeout).await {
            return true;
        }
        self.drop_client(client_id).await;
        false
    }

    async fn drop_client(&self, client_id: u64) {
        if self.clients.lock().await.remove(&client_id).is_some() {
            info!(client = client_id, "client dropped");
        }
    }

    async fn run_client(self: &Arc<Self>, socket: WebSocket) {
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = socket.split();
        let sender = Arc::new(Mutex::new(sender));
        self.clients
            .lock()
            .await
            .insert(client_id, Client { sender: Arc::clone(&sender) });
        info!(client = client_id, "client connected");

        let handler = self.handler.get().cloned();
        if let Some(h) = &handler {
            h.on_connect(client_id).await;
        }

        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) if envelope.kind == "ping" => {
                        // Keepalive is answered at the protocol layer, not
                        // routed to the handler.
                        self.send_to(client_id, &Envelope::new("pong")).await;
                    }
                    Ok(envelope) => {
                        if let Some(h) = &handler {
                            h.on_message(client_id, envelope).await;
                        }
                    }
                    Err(e) => {
                        warn!(client = client_id, "malformed envelope: {e}");
                        self.send_to(
                            client_id,
                            &Envelope::error(
                                format!("malformed envelope: {e}"),
                                "INVALID_MESSAGE",
                            ),
                        )
                        .await;
                    }
                },
                Ok(Message::Ping(data)) => {
                    let mut s = sender.lock().await;
                    if s.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // binary frames ignored
                Err(e) => {
                    debug!(client = client_id, "receive error: {e}");
                    break;
                }
            }
        }

        self.drop_client(client_id).await;
        info!(client = client_id, "client disconnected");
    }
}

#[async_trait]
impl EventSink for Hub {
    async fn broadcast(&self, envelope: Envelope) {
        // Snapshot under the lock, send outside it.
        let targets: Vec<(u64, Arc<Mutex<SplitSink<WebSocket, Message>>>)> = {
            self.clients
                .lock()
                .await
                .iter()
                .map(|(id, c)| (*id, Arc::clone(&c.sender)))
                .collect()
        };

        // All sends run concurrently: N stalled clients share one timeout
        // window instead of stacking N of them in front of whoever comes
        // later in the iteration.
        let envelope = &envelope;
        let outcomes = join_all(targets.into_iter().map(|(id, sender)| async move {
            (id, send_envelope(&sender, envelope, self.send_timeout).await)
        }))
        .await;

        for (id, delivered) in outcomes {
            if !delivered {
                warn!(client = id, kind = %envelope.kind, "dropping unresponsive client");
                self.drop_client(id).await;
            }
        }
    }
}

async fn send_envelope(
    sender: &Mutex<SplitSink<WebSocket, Message>>,
    envelope: &Envelope,
    send_timeout: Duration,
) -> bool {
    let json = match serde_json::to_string(envelope) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to encode envelope: {e}");
            return true; // encoding is our bug, not the client's
        }
    };
    let send = async {
        let mut s = sender.lock().await;
        s.send(Message::Text(json)).await
    };
    match tokio::time::timeout(send_timeout, send).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("send failed: {e}");
            false
        }
        Err(_) => {
            debug!("send timed out after {send_timeout:?}");
            false
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| async move { hub.run_client(socket).await })
}
