// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client: JSON-RPC 2.0 over stdio to external tool-provider processes.
//!
//! [`framing`] is the wire codec, [`server`] supervises one child process,
//! and [`manager`] owns the fleet plus the flat tool catalog. Callers reach
//! tools through the [`ToolInvoker`] seam so the chat engine and the
//! workflow executor can be tested against a stub.

pub mod framing;
pub mod manager;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use manager::{McpConfig, McpManager, McpServerConfig};
pub use server::McpServer;

/// MCP protocol revision sent with `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool discovered on a server, as offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    /// Owning server name from the config file.
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Normalized outcome of a tool call. Failures a tool reports about itself
/// arrive here with `is_error = true`; transport-level failures are
/// [`McpError`]s instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// No active server exposes a tool with this name. Distinct from a tool
    /// that ran and reported an error.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The child exited while requests were pending.
    #[error("server {0} crashed")]
    ServerCrashed(String),

    #[error("failed to spawn {0}: {1}")]
    Spawn(String, String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Tool-routing surface consumed by the chat engine and workflow executor.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Snapshot of the active tool catalog.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Dispatch to the owning server, or fail with
    /// [`McpError::ToolNotFound`].
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError>;
}
