// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key carrying the tool-use id on `tool_use` / `tool_result`
/// messages. The pairing invariant is keyed on this value.
pub const META_TOOL_ID: &str = "toolId";
/// Metadata key carrying the tool name on `tool_use` messages.
pub const META_TOOL_NAME: &str = "toolName";
/// Metadata key, `"true"` when a `tool_result` reports a failure.
pub const META_IS_ERROR: &str = "isError";

/// Role tag of a stored conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    Thinking,
    ToolUse,
    ToolResult,
}

impl ChatRole {
    /// The API role this message belongs to when building the wire format.
    /// `user` and `tool_result` blocks ride in `user` messages; everything
    /// the model produced rides in `assistant` messages.
    pub fn api_role(self) -> &'static str {
        match self {
            ChatRole::User | ChatRole::ToolResult => "user",
            ChatRole::Assistant | ChatRole::Thinking | ChatRole::ToolUse => "assistant",
        }
    }
}

/// A single role-tagged message in a conversation.
///
/// `content` is the payload as a string: plain text for `user` /
/// `assistant` / `thinking` / `tool_result`, and the serialized input JSON
/// for `tool_use`. Tool pairing metadata lives in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Thinking, content)
    }

    /// A `tool_use` message; `input_json` is the serialized tool input.
    pub fn tool_use(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        input_json: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(ChatRole::ToolUse, input_json);
        msg.metadata.insert(META_TOOL_ID.into(), tool_id.into());
        msg.metadata.insert(META_TOOL_NAME.into(), tool_name.into());
        msg
    }

    pub fn tool_result(
        tool_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut msg = Self::new(ChatRole::ToolResult, content);
        msg.metadata.insert(META_TOOL_ID.into(), tool_id.into());
        if is_error {
            msg.metadata.insert(META_IS_ERROR.into(), "true".into());
        }
        msg
    }

    /// Tool-use id for `tool_use` / `tool_result` messages.
    pub fn tool_id(&self) -> Option<&str> {
        self.metadata.get(META_TOOL_ID).map(String::as_str)
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get(META_TOOL_NAME).map(String::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.metadata.get(META_IS_ERROR).map(String::as_str) == Some("true")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_map_to_api_roles() {
        assert_eq!(ChatRole::User.api_role(), "user");
        assert_eq!(ChatRole::ToolResult.api_role(), "user");
        assert_eq!(ChatRole::Assistant.api_role(), "assistant");
        assert_eq!(ChatRole::Thinking.api_role(), "assistant");
        assert_eq!(ChatRole::ToolUse.api_role(), "assistant");
    }

    #[test]
    fn tool_use_carries_id_and_name() {
        let m = ChatMessage::tool_use("t1", "read_file", r#"{"path":"/tmp/x"}"#);
        assert_eq!(m.tool_id(), Some("t1"));
        assert_eq!(m.tool_name(), Some("read_file"));
        assert!(!m.is_error());
    }

    #[test]
    fn tool_result_error_flag_round_trips() {
        let m = ChatMessage::tool_result("t1", "boom", true);
        let json = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_id(), Some("t1"));
        assert!(back.is_error());
        assert_eq!(back.role, ChatRole::ToolResult);
    }

    #[test]
    fn role_serializes_snake_case() {
        let m = ChatMessage::tool_use("t", "n", "{}");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "tool_use");
    }
}
