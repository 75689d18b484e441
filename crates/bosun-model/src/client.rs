// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming client for the Anthropic-style chat completion endpoint.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::sse::{BlockTracker, FrameAccumulator, StreamEvent};
use crate::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL, THINKING_BUDGET_TOKENS};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Per-request read inactivity ceiling.
const READ_TIMEOUT: Duration = Duration::from_secs(300);
/// Whole-request ceiling, generous enough for a long thinking turn.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

/// A tool definition offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One streaming chat request. `messages` is the sanitized API message
/// array produced by [`crate::transcript::sanitize`].
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Value>,
    pub system: Option<String>,
    pub tools: Vec<ToolSpec>,
}

/// Seam between the chat engine and the upstream model.
///
/// The production impl is [`AnthropicClient`]; tests use
/// [`crate::mock::MockProvider`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<EventStream>;
}

pub struct AnthropicClient {
    model: String,
    max_tokens: u32,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| DEFAULT_MODEL.into()),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::builder()
                .read_timeout(READ_TIMEOUT)
                .timeout(TOTAL_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": req.messages,
            "stream": true,
            "thinking": { "type": "enabled", "budget_tokens": THINKING_BUDGET_TOKENS },
        });
        if let Some(system) = &req.system {
            if !system.trim().is_empty() {
                body["system"] = json!(system);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let body = self.build_body(&req);
        debug!(model = %self.model, tools = req.tools.len(), "sending chat request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("chat request failed")?;

        // A non-2xx becomes a single error event and the stream ends; the
        // caller surfaces it to the client instead of retrying blindly.
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let stream = futures::stream::once(async move {
                Ok(StreamEvent::Error(format!("chat endpoint {status}: {text}")))
            });
            return Ok(Box::pin(stream));
        }

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            // SSE lines can be split across TCP chunks; carry the remainder
            // forward and only parse complete lines.
            let mut buf = String::new();
            let mut frames = FrameAccumulator::new();
            let mut tracker = BlockTracker::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Ok(StreamEvent::Error(format!("stream transport error: {e}")));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    if let Some(frame) = frames.push_line(line.trim_end_matches('\n')) {
                        for ev in tracker.handle_frame(&frame) {
                            yield Ok(ev);
                        }
                    }
                }
            }
            if let Some(frame) = frames.finish() {
                for ev in tracker.handle_frame(&frame) {
                    yield Ok(ev);
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Run a single non-streaming-style turn and return the concatenated text.
///
/// Used by helpers that want one answer (workflow drafting) rather than a
/// live delta stream; thinking and tool events are discarded.
pub async fn complete_text(
    provider: &dyn ChatProvider,
    system: Option<String>,
    user: &str,
) -> anyhow::Result<String> {
    let req = ChatRequest {
        messages: vec![json!({
            "role": "user",
            "content": [{ "type": "text", "text": user }],
        })],
        system,
        tools: Vec::new(),
    };
    let mut stream = provider.stream_chat(req).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(t) => text.push_str(&t),
            StreamEvent::Error(e) => anyhow::bail!("chat turn failed: {e}"),
            StreamEvent::MessageComplete => break,
            _ => {}
        }
    }
    Ok(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new("sk-test".into(), None, None)
    }

    #[test]
    fn body_always_enables_thinking() {
        let body = client().build_body(&ChatRequest::default());
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], THINKING_BUDGET_TOKENS);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn body_omits_empty_system_and_tools() {
        let body = client().build_body(&ChatRequest {
            system: Some("   ".into()),
            ..Default::default()
        });
        assert!(body.get("system").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn body_includes_tool_definitions() {
        let req = ChatRequest {
            tools: vec![ToolSpec {
                name: "read_file".into(),
                description: "Reads a file".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let body = client().build_body(&req);
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn complete_text_concatenates_deltas() {
        use crate::mock::MockProvider;
        let mock = MockProvider::new(vec![vec![
            StreamEvent::TextStart,
            StreamEvent::TextDelta("hello ".into()),
            StreamEvent::TextDelta("world".into()),
            StreamEvent::TextDone,
            StreamEvent::MessageComplete,
        ]]);
        let text = complete_text(&mock, None, "hi").await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn complete_text_propagates_stream_errors() {
        use crate::mock::MockProvider;
        let mock = MockProvider::new(vec![vec![StreamEvent::Error("boom".into())]]);
        assert!(complete_text(&mock, None, "hi").await.is_err());
    }
}
