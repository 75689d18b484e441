// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transcript sanitization: make a stored conversation safe to send.
//!
//! The messages API rejects a transcript in which a `tool_use` block has no
//! matching `tool_result`. A client disconnect or daemon restart mid-turn
//! leaves exactly that shape on disk, so every read path goes through
//! [`sanitize`]: orphaned tool calls are paired with a synthetic error
//! result, then consecutive same-role messages are coalesced into single
//! API messages of content blocks in their original order.

use serde_json::{json, Value};

use crate::types::{ChatMessage, ChatRole};

/// Content of the synthetic `tool_result` paired with an orphaned call.
pub const INTERRUPTED_TOOL_RESULT: &str =
    "Error: tool call was interrupted (client disconnected or timeout)";

/// Pair every orphaned `tool_use` with a synthetic error `tool_result`,
/// inserted after the run of tool messages it belongs to and before the
/// next non-tool message. Idempotent: a repaired transcript has no orphans
/// left, so a second pass returns it unchanged.
pub fn repair(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    use std::collections::HashSet;

    let result_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::ToolResult)
        .filter_map(|m| m.tool_id())
        .collect();

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending_orphans: Vec<String> = Vec::new();

    for msg in messages {
        let is_tool_msg = matches!(msg.role, ChatRole::ToolUse | ChatRole::ToolResult);
        if !is_tool_msg && !pending_orphans.is_empty() {
            flush_orphans(&mut out, &mut pending_orphans);
        }
        if msg.role == ChatRole::ToolUse {
            if let Some(id) = msg.tool_id() {
                if !result_ids.contains(id) {
                    pending_orphans.push(id.to_string());
                }
            }
        }
        out.push(msg.clone());
    }
    flush_orphans(&mut out, &mut pending_orphans);
    out
}

fn flush_orphans(out: &mut Vec<ChatMessage>, orphans: &mut Vec<String>) {
    for id in orphans.drain(..) {
        out.push(ChatMessage::tool_result(id, INTERRUPTED_TOOL_RESULT, true));
    }
}

/// Convert a (repaired) message list into the API message array.
///
/// `user` and `tool_result` messages belong to API role `user`;
/// `assistant`, `thinking`, and `tool_use` to `assistant`. Consecutive
/// messages of the same API role collapse into one message whose content
/// is the ordered block list.
pub fn to_api_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut current_role: Option<&'static str> = None;
    let mut current_blocks: Vec<Value> = Vec::new();

    for msg in messages {
        let Some(block) = content_block(msg) else {
            continue;
        };
        let role = msg.role.api_role();
        if current_role != Some(role) {
            flush_message(&mut out, current_role.take(), &mut current_blocks);
            current_role = Some(role);
        }
        current_blocks.push(block);
    }
    flush_message(&mut out, current_role, &mut current_blocks);
    out
}

fn flush_message(out: &mut Vec<Value>, role: Option<&'static str>, blocks: &mut Vec<Value>) {
    if let Some(role) = role {
        if !blocks.is_empty() {
            out.push(json!({ "role": role, "content": std::mem::take(blocks) }));
        }
    }
}

fn content_block(msg: &ChatMessage) -> Option<Value> {
    match msg.role {
        ChatRole::User | ChatRole::Assistant => {
            // The API rejects empty text blocks; drop them.
            if msg.content.trim().is_empty() {
                return None;
            }
            Some(json!({ "type": "text", "text": msg.content }))
        }
        ChatRole::Thinking => {
            if msg.content.trim().is_empty() {
                return None;
            }
            Some(json!({ "type": "thinking", "thinking": msg.content }))
        }
        ChatRole::ToolUse => {
            let input: Value =
                serde_json::from_str(&msg.content).unwrap_or_else(|_| json!({}));
            Some(json!({
                "type": "tool_use",
                "id": msg.tool_id().unwrap_or_default(),
                "name": msg.tool_name().unwrap_or_default(),
                "input": input,
            }))
        }
        ChatRole::ToolResult => {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_id().unwrap_or_default(),
                "content": msg.content,
            });
            if msg.is_error() {
                block["is_error"] = json!(true);
            }
            Some(block)
        }
    }
}

/// Repair then coalesce: the full path a conversation takes before any
/// LLM call.
pub fn sanitize(messages: &[ChatMessage]) -> Vec<Value> {
    to_api_messages(&repair(messages))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
