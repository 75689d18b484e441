// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scripted [`ChatProvider`] for tests.
//!
//! Each call to [`MockProvider::stream_chat`] pops the next scripted turn
//! and streams its events in order. Requests are recorded so tests can
//! assert on the message array and tool catalog the engine sent.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{ChatProvider, ChatRequest, EventStream};
use crate::sse::StreamEvent;

pub struct MockProvider {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let events = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StreamEvent::MessageComplete]);
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}
