// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The one JSON message shape spoken over the WebSocket, both directions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{type, id?, conversationId?, content?, metadata?}`.
///
/// `type` discriminates; everything else is optional and type-dependent.
/// Metadata values are arbitrary JSON so counts and flags do not have to be
/// stringified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "conversationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The `error` envelope sent for failures the client should see.
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new("error")
            .with_content(message)
            .with_meta("code", code.into())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let env = Envelope::new("user_message")
            .with_conversation("c-1")
            .with_content("hello")
            .with_meta("source", "test");
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn wire_field_names_match_the_protocol() {
        let env = Envelope::new("status").with_conversation("c-9");
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["conversationId"], "c-9");
        assert!(v.get("content").is_none(), "absent fields are omitted");
    }

    #[test]
    fn decodes_with_missing_optionals() {
        let env: Envelope = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.metadata.is_empty());
    }

    #[test]
    fn metadata_holds_arbitrary_json() {
        let env = Envelope::new("status")
            .with_meta("connected", true)
            .with_meta("toolCount", 3);
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["metadata"]["connected"], true);
        assert_eq!(v["metadata"]["toolCount"], 3);
    }

    #[test]
    fn error_helper_sets_code() {
        let env = Envelope::error("bad frame", "INVALID_MESSAGE");
        assert_eq!(env.kind, "error");
        assert_eq!(env.metadata["code"], "INVALID_MESSAGE");
    }
}
