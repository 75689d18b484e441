// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Drives one LLM turn to completion per inbound user message.
//!
//! A turn is a loop: persist the inbound message, stream the model's
//! response, translate every stream event into a broadcast envelope (and a
//! persisted message where durable), execute tool calls as their input
//! completes, and re-enter with the updated transcript while the model
//! keeps requesting tools. Turns on the same conversation are serialized
//! by a per-conversation mutex; broadcasts are awaited one by one so event
//! order on the wire matches the order the model produced them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bosun_mcp::{ToolCallResult, ToolInvoker};
use bosun_model::{transcript, ChatMessage, ChatProvider, ChatRequest, StreamEvent, ToolSpec};
use bosun_node::{Envelope, EventSink};
use bosun_store::{Conversation, ConversationStore};

/// Hard cap on model round-trips within one user turn. A model stuck in a
/// tool loop stops here rather than burning tokens forever.
pub const MAX_TURNS: usize = 16;

pub struct ChatEngine {
    store: Arc<ConversationStore>,
    tools: Arc<dyn ToolInvoker>,
    provider: Option<Arc<dyn ChatProvider>>,
    sink: Arc<dyn EventSink>,
    system_prompt: Option<String>,
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        tools: Arc<dyn ToolInvoker>,
        provider: Option<Arc<dyn ChatProvider>>,
        sink: Arc<dyn EventSink>,
        system_prompt: Option<String>,
    ) -> Self {
        if provider.is_none() {
            warn!("no API key configured; chat turns will fail until one is set");
        }
        Self {
            store,
            tools,
            provider,
            sink,
            system_prompt,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Handle one inbound user message: the whole turn, including any
    /// tool-use/tool-result cycles, runs before this returns.
    pub async fn handle_user_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        // Two concurrent messages on the same conversation must not
        // interleave their broadcasts or their writes.
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let Some(provider) = self.provider.clone() else {
            self.sink
                .broadcast(
                    Envelope::error("no api key", "NO_API_KEY")
                        .with_conversation(conversation_id),
                )
                .await;
            return Ok(());
        };

        let mut conversation = self.load_or_create(conversation_id);
        conversation.messages.push(ChatMessage::user(content));
        self.store.save(&conversation)?;

        for round in 1..=MAX_TURNS {
            debug!(conversation = conversation_id, round, "starting model round");
            let had_tool_calls = match self.stream_one_round(&provider, &mut conversation).await
            {
                Ok(had) => had,
                Err(e) => {
                    // Transport-level failure: tell the client and stop.
                    // The transcript stays consistent; the repair on next
                    // read covers any half-finished tool call.
                    warn!(conversation = conversation_id, "turn failed: {e:#}");
                    self.sink
                        .broadcast(
                            Envelope::error(format!("{e:#}"), "CHAT_ERROR")
                                .with_conversation(conversation_id),
                        )
                        .await;
                    return Ok(());
                }
            };
            if !had_tool_calls {
                return Ok(());
            }
        }
        warn!(
            conversation = conversation_id,
            "turn cap of {MAX_TURNS} rounds reached, stopping"
        );
        Ok(())
    }

    async fn conversation_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn load_or_create(&self, id: &str) -> Conversation {
        match self.store.load(id) {
            Ok(c) => c,
            Err(_) => {
                let mut c = Conversation::new();
                c.id = id.to_string();
                c
            }
        }
    }

    /// One model round: stream events, translate, execute tool calls.
    /// Returns whether any tool call completed (the loop re-enters then).
    async fn stream_one_round(
        &self,
        provider: &Arc<dyn ChatProvider>,
        conversation: &mut Conversation,
    ) -> anyhow::Result<bool> {
        let req = ChatRequest {
            messages: transcript::sanitize(&conversation.messages),
            system: self.system_prompt.clone(),
            tools: self
                .tools
                .tool_definitions()
                .into_iter()
                .map(|t| ToolSpec {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                })
                .collect(),
        };

        let mut stream = provider.stream_chat(req).await?;
        let conv_id = conversation.id.clone();
        let mut text_buf = String::new();
        let mut thinking_buf = String::new();
        let mut had_tool_calls = false;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::ThinkingStart | StreamEvent::TextStart => {}
                StreamEvent::ThinkingDelta(delta) => {
                    thinking_buf.push_str(&delta);
                    self.emit(&conv_id, Envelope::new("thinking_chunk").with_content(delta))
                        .await;
                }
                StreamEvent::ThinkingDone => {
                    let thinking = std::mem::take(&mut thinking_buf);
                    if !thinking.is_empty() {
                        conversation.messages.push(ChatMessage::thinking(&thinking));
                        self.store.save(conversation)?;
                    }
                    self.emit(
                        &conv_id,
                        Envelope::new("thinking_done").with_content(thinking),
                    )
                    .await;
                }
                StreamEvent::TextDelta(delta) => {
                    text_buf.push_str(&delta);
                    self.emit(&conv_id, Envelope::new("assistant_chunk").with_content(delta))
                        .await;
                }
                StreamEvent::TextDone => {
                    let text = std::mem::take(&mut text_buf);
                    if !text.is_empty() {
                        conversation.messages.push(ChatMessage::assistant(&text));
                        self.store.save(conversation)?;
                    }
                    self.emit(&conv_id, Envelope::new("assistant_done").with_content(text))
                        .await;
                }
                StreamEvent::ToolUseStart { .. } | StreamEvent::ToolUseInputDelta(_) => {}
                StreamEvent::ToolUseDone { id, name, input } => {
                    had_tool_calls = true;
                    self.run_tool_call(conversation, &id, &name, input).await?;
                }
                StreamEvent::MessageComplete => break,
                StreamEvent::Error(msg) => {
                    anyhow::bail!("model stream error: {msg}");
                }
            }
        }
        Ok(had_tool_calls)
    }

    /// Persist the call, invoke the tool, persist the result — with the
    /// matching broadcasts around it. A failing tool becomes an error
    /// result the model can react to, never a failed turn.
    async fn run_tool_call(
        &self,
        conversation: &mut Conversation,
        tool_id: &str,
        tool_name: &str,
        input: serde_json::Value,
    ) -> anyhow::Result<()> {
        let conv_id = conversation.id.clone();
        conversation
            .messages
            .push(ChatMessage::tool_use(tool_id, tool_name, input.to_string()));
        self.store.save(conversation)?;
        self.emit(
            &conv_id,
            Envelope::new("tool_call_start")
                .with_content(input.to_string())
                .with_meta("toolId", tool_id)
                .with_meta("toolName", tool_name),
        )
        .await;

        let result = match self.tools.call_tool(tool_name, input).await {
            Ok(result) => result,
            Err(e) => ToolCallResult::error(format!("Error: {e}")),
        };

        conversation.messages.push(ChatMessage::tool_result(
            tool_id,
            &result.content,
            result.is_error,
        ));
        self.store.save(conversation)?;
        self.emit(
            &conv_id,
            Envelope::new("tool_call_done")
                .with_content(result.content)
                .with_meta("toolId", tool_id)
                .with_meta("toolName", tool_name)
                .with_meta("isError", json!(result.is_error)),
        )
        .await;
        Ok(())
    }

    async fn emit(&self, conversation_id: &str, envelope: Envelope) {
        self.sink
            .broadcast(envelope.with_conversation(conversation_id))
            .await;
    }
}
