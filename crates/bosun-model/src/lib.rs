// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chat message types, the streaming LLM client, and transcript sanitization.
//!
//! The wire protocol is the Anthropic-style messages API: a POST returning
//! server-sent events, one event per text/thinking/tool delta. [`sse`]
//! turns the byte stream into typed [`StreamEvent`]s; [`transcript`] turns
//! a stored conversation into the API message array, repairing orphaned
//! tool calls so a restart never produces a transcript the endpoint
//! rejects.

pub mod client;
pub mod mock;
pub mod sse;
pub mod transcript;
mod types;

pub use client::{AnthropicClient, ChatProvider, ChatRequest, EventStream, ToolSpec};
pub use sse::StreamEvent;
pub use types::{ChatMessage, ChatRole, META_IS_ERROR, META_TOOL_ID, META_TOOL_NAME};

/// Model used when the caller does not override it.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default output-token ceiling. Must exceed [`THINKING_BUDGET_TOKENS`]
/// because the thinking budget is carved out of `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 16_000;

/// Extended-thinking budget sent with every request.
pub const THINKING_BUDGET_TOKENS: u32 = 10_000;
