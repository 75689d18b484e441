// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-sent-event parsing for the streaming chat endpoint.
//!
//! Two small state machines: [`FrameAccumulator`] assembles `event:` /
//! `data:` lines into frames, and [`BlockTracker`] turns frames into typed
//! [`StreamEvent`]s, tracking open content blocks by index so tool-use
//! input JSON can be accumulated across deltas.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

/// Typed event emitted by the streaming chat client.
///
/// Ordering within a block is the order the deltas arrived; block
/// start/stop pairs are well nested per index.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingDone,
    TextStart,
    TextDelta(String),
    TextDone,
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta(String),
    ToolUseDone { id: String, name: String, input: Value },
    MessageComplete,
    Error(String),
}

/// One complete SSE frame: the `event:` name and the `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Assembles frames from individual SSE lines.
///
/// A frame is complete when an empty line arrives with buffered data, when
/// a new `event:` line arrives while data is buffered (the previous frame
/// is flushed first), or at end of stream via [`FrameAccumulator::finish`].
/// Comment and id lines are ignored.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    event: String,
    data: String,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns a completed
    /// frame when this line finished one.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return self.take_frame();
        }
        if let Some(name) = line.strip_prefix("event:") {
            // A new event name while data is buffered means the previous
            // frame was never terminated by a blank line; flush it first.
            let flushed = self.take_frame();
            self.event = name.trim().to_string();
            return flushed;
        }
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(payload);
        }
        None
    }

    /// Flush a trailing frame at end of stream.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.take_frame()
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event.clear();
            return None;
        }
        Some(SseFrame {
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data),
        })
    }
}

enum OpenBlock {
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        input_buf: String,
    },
}

/// Tracks open content blocks by index and maps frames to [`StreamEvent`]s.
#[derive(Default)]
pub struct BlockTracker {
    blocks: HashMap<u64, OpenBlock>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one frame. A payload that fails to decode drops that one
    /// event; the stream is not torn down.
    pub fn handle_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let v: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(event = %frame.event, "dropping undecodable SSE frame: {e}");
                return Vec::new();
            }
        };
        // The payload's own type field is authoritative; the `event:` name
        // merely mirrors it.
        let event_type = v["type"].as_str().unwrap_or(frame.event.as_str());
        match event_type {
            "content_block_start" => self.block_start(&v),
            "content_block_delta" => self.block_delta(&v),
            "content_block_stop" => self.block_stop(&v),
            "message_stop" => vec![StreamEvent::MessageComplete],
            "error" => {
                let msg = v["error"]["message"]
                    .as_str()
                    .unwrap_or(&frame.data)
                    .to_string();
                vec![StreamEvent::Error(msg)]
            }
            // message_start / message_delta / ping carry nothing we stream.
            _ => Vec::new(),
        }
    }

    fn block_start(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        let block = &v["content_block"];
        match block["type"].as_str().unwrap_or("") {
            "thinking" => {
                self.blocks.insert(index, OpenBlock::Thinking);
                vec![StreamEvent::ThinkingStart]
            }
            "tool_use" => {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                self.blocks.insert(
                    index,
                    OpenBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input_buf: String::new(),
                    },
                );
                vec![StreamEvent::ToolUseStart { id, name }]
            }
            _ => {
                self.blocks.insert(index, OpenBlock::Text);
                vec![StreamEvent::TextStart]
            }
        }
    }

    fn block_delta(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        let delta = &v["delta"];
        match delta["type"].as_str().unwrap_or("") {
            "text_delta" => {
                let text = delta["text"].as_str().unwrap_or("").to_string();
                vec![StreamEvent::TextDelta(text)]
            }
            "thinking_delta" => {
                let text = delta["thinking"].as_str().unwrap_or("").to_string();
                vec![StreamEvent::ThinkingDelta(text)]
            }
            "input_json_delta" => {
                let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                if let Some(OpenBlock::ToolUse { input_buf, .. }) = self.blocks.get_mut(&index) {
                    input_buf.push_str(&partial);
                }
                vec![StreamEvent::ToolUseInputDelta(partial)]
            }
            // signature_delta and unknown delta kinds carry nothing we stream.
            _ => Vec::new(),
        }
    }

    fn block_stop(&mut self, v: &Value) -> Vec<StreamEvent> {
        let index = v["index"].as_u64().unwrap_or(0);
        match self.blocks.remove(&index) {
            Some(OpenBlock::Text) => vec![StreamEvent::TextDone],
            Some(OpenBlock::Thinking) => vec![StreamEvent::ThinkingDone],
            Some(OpenBlock::ToolUse {
                id,
                name,
                input_buf,
            }) => {
                // An empty or malformed input accumulation resolves to {}
                // so the tool call can still be dispatched.
                let input = if input_buf.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&input_buf).unwrap_or_else(|e| {
                        warn!(tool = %name, "tool input JSON did not parse: {e}");
                        Value::Object(Default::default())
                    })
                };
                vec![StreamEvent::ToolUseDone { id, name, input }]
            }
            None => {
                warn!(index, "content_block_stop for unknown block index");
                Vec::new()
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(data: Value) -> SseFrame {
        SseFrame {
            event: data["type"].as_str().unwrap_or("").to_string(),
            data: data.to_string(),
        }
    }

    // ── FrameAccumulator ───────────────────────────────────────────────────

    #[test]
    fn blank_line_completes_a_frame() {
        let mut acc = FrameAccumulator::new();
        assert!(acc.push_line("event: message_stop").is_none());
        assert!(acc.push_line("data: {\"type\":\"message_stop\"}").is_none());
        let f = acc.push_line("").unwrap();
        assert_eq!(f.event, "message_stop");
        assert_eq!(f.data, "{\"type\":\"message_stop\"}");
    }

    #[test]
    fn new_event_line_flushes_buffered_frame() {
        let mut acc = FrameAccumulator::new();
        acc.push_line("event: ping");
        acc.push_line("data: {}");
        let f = acc.push_line("event: message_stop").unwrap();
        assert_eq!(f.event, "ping");
        assert_eq!(f.data, "{}");
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut acc = FrameAccumulator::new();
        acc.push_line("data: tail");
        let f = acc.finish().unwrap();
        assert_eq!(f.data, "tail");
        assert!(acc.finish().is_none());
    }

    #[test]
    fn blank_line_without_data_is_ignored() {
        let mut acc = FrameAccumulator::new();
        assert!(acc.push_line("").is_none());
        assert!(acc.push_line("event: ping").is_none());
        assert!(acc.push_line("").is_none());
    }

    #[test]
    fn crlf_line_endings_are_stripped() {
        let mut acc = FrameAccumulator::new();
        acc.push_line("data: {\"a\":1}\r");
        let f = acc.push_line("\r").unwrap();
        assert_eq!(f.data, "{\"a\":1}");
    }

    // ── BlockTracker ───────────────────────────────────────────────────────

    #[test]
    fn text_block_interleave_matches_expected_sequence() {
        // content_block_start(0,text), two text deltas, stop, message_stop.
        let mut t = BlockTracker::new();
        let mut out = Vec::new();
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}
        }))));
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "Hel"}
        }))));
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "lo"}
        }))));
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_stop", "index": 0
        }))));
        out.extend(t.handle_frame(&frame(json!({"type": "message_stop"}))));
        assert_eq!(
            out,
            vec![
                StreamEvent::TextStart,
                StreamEvent::TextDelta("Hel".into()),
                StreamEvent::TextDelta("lo".into()),
                StreamEvent::TextDone,
                StreamEvent::MessageComplete,
            ]
        );
    }

    #[test]
    fn tool_use_block_accumulates_input_json() {
        let mut t = BlockTracker::new();
        let start = t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_01", "name": "read_file"}
        })));
        assert_eq!(
            start,
            vec![StreamEvent::ToolUseStart {
                id: "toolu_01".into(),
                name: "read_file".into()
            }]
        );
        t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"path\":"}
        })));
        t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "\"/tmp/x\"}"}
        })));
        let done = t.handle_frame(&frame(json!({
            "type": "content_block_stop", "index": 1
        })));
        assert_eq!(
            done,
            vec![StreamEvent::ToolUseDone {
                id: "toolu_01".into(),
                name: "read_file".into(),
                input: json!({"path": "/tmp/x"}),
            }]
        );
    }

    #[test]
    fn tool_use_with_empty_input_resolves_to_empty_object() {
        let mut t = BlockTracker::new();
        t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "tool_use", "id": "t", "name": "n"}
        })));
        let done = t.handle_frame(&frame(json!({
            "type": "content_block_stop", "index": 0
        })));
        assert_eq!(
            done,
            vec![StreamEvent::ToolUseDone {
                id: "t".into(),
                name: "n".into(),
                input: json!({}),
            }]
        );
    }

    #[test]
    fn thinking_block_maps_to_thinking_events() {
        let mut t = BlockTracker::new();
        let mut out = Vec::new();
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "thinking"}
        }))));
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "thinking_delta", "thinking": "hmm"}
        }))));
        out.extend(t.handle_frame(&frame(json!({
            "type": "content_block_stop", "index": 0
        }))));
        assert_eq!(
            out,
            vec![
                StreamEvent::ThinkingStart,
                StreamEvent::ThinkingDelta("hmm".into()),
                StreamEvent::ThinkingDone,
            ]
        );
    }

    #[test]
    fn signature_delta_is_silently_discarded() {
        let mut t = BlockTracker::new();
        t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "thinking"}
        })));
        let out = t.handle_frame(&frame(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "signature_delta", "signature": "EqRk..."}
        })));
        assert!(out.is_empty());
    }

    #[test]
    fn undecodable_payload_drops_only_that_event() {
        let mut t = BlockTracker::new();
        let out = t.handle_frame(&SseFrame {
            event: "content_block_delta".into(),
            data: "{not json".into(),
        });
        assert!(out.is_empty());
        // The tracker keeps working afterwards.
        let out = t.handle_frame(&frame(json!({"type": "message_stop"})));
        assert_eq!(out, vec![StreamEvent::MessageComplete]);
    }

    #[test]
    fn error_event_carries_the_message() {
        let mut t = BlockTracker::new();
        let out = t.handle_frame(&frame(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })));
        assert_eq!(out, vec![StreamEvent::Error("Overloaded".into())]);
    }

    #[test]
    fn ping_and_message_delta_are_ignored() {
        let mut t = BlockTracker::new();
        assert!(t.handle_frame(&frame(json!({"type": "ping"}))).is_empty());
        assert!(t
            .handle_frame(&frame(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"}
            })))
            .is_empty());
    }

    #[test]
    fn parallel_blocks_are_tracked_independently() {
        let mut t = BlockTracker::new();
        t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "text"}
        })));
        t.handle_frame(&frame(json!({
            "type": "content_block_start", "index": 1,
            "content_block": {"type": "tool_use", "id": "a", "name": "x"}
        })));
        let stop0 = t.handle_frame(&frame(json!({"type": "content_block_stop", "index": 0})));
        assert_eq!(stop0, vec![StreamEvent::TextDone]);
        let stop1 = t.handle_frame(&frame(json!({"type": "content_block_stop", "index": 1})));
        assert!(matches!(stop1[0], StreamEvent::ToolUseDone { .. }));
    }
}
