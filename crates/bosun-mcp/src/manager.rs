// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pool of MCP servers and the flat tool catalog.
//!
//! The manager reads `{mcpServers: {name -> {command, args, env, url}}}`,
//! spawns one [`McpServer`] per stdio entry, and indexes every discovered
//! tool by name. Tool names are globally unique across the active set: the
//! earliest-registered server wins a collision, later bindings are logged
//! and dropped. A server that fails to start is simply absent from the
//! catalog — the daemon runs with whatever came up.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::server::McpServer;
use crate::{McpError, ToolCallResult, ToolDefinition, ToolInvoker};

/// One entry under `mcpServers`. Entries without a `command` (including
/// URL-only remote transports) are skipped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServerConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
}

/// The MCP server config file.
///
/// A `BTreeMap` keeps startup order deterministic, which is what makes
/// "earliest-registered wins" a stable rule rather than a coin toss.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Load the config file; an absent file is an empty config, not an
    /// error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct McpManager {
    servers: BTreeMap<String, Arc<McpServer>>,
    catalog: Vec<ToolDefinition>,
    /// tool name -> owning server name.
    index: HashMap<String, String>,
}

impl McpManager {
    /// Spawn every configured stdio server and build the tool catalog.
    ///
    /// Startup failures (spawn error, initialize timeout, discovery
    /// failure) log and skip that server.
    pub async fn start(config: McpConfig) -> Self {
        let mut manager = Self {
            servers: BTreeMap::new(),
            catalog: Vec::new(),
            index: HashMap::new(),
        };

        for (name, cfg) in &config.mcp_servers {
            let Some(command) = cfg.command.as_deref() else {
                if cfg.url.is_some() {
                    info!(server = %name, "skipping non-stdio server (url transport)");
                } else {
                    info!(server = %name, "skipping server with no command");
                }
                continue;
            };

            let server = match McpServer::spawn(name, command, &cfg.args, &cfg.env).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(server = %name, "startup failed, continuing without it: {e:#}");
                    continue;
                }
            };

            let tools = match server.list_tools().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(server = %name, "tool discovery failed, continuing without it: {e}");
                    server.stop().await;
                    continue;
                }
            };

            info!(server = %name, tools = tools.len(), "server online");
            for tool in tools {
                manager.register_tool(tool);
            }
            manager.servers.insert(name.clone(), server);
        }

        manager
    }

    fn register_tool(&mut self, tool: ToolDefinition) {
        if let Some(owner) = self.index.get(&tool.name) {
            warn!(
                tool = %tool.name,
                owner = %owner,
                loser = %tool.server,
                "tool name collision, keeping earliest registration"
            );
            return;
        }
        self.index.insert(tool.name.clone(), tool.server.clone());
        self.catalog.push(tool);
    }

    pub fn active_server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub async fn stop_all(&self) {
        for server in self.servers.values() {
            server.stop().await;
        }
    }
}

#[async_trait]
impl ToolInvoker for McpManager {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.catalog.clone()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let server_name = self
            .index
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        server.call_tool(name, arguments).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str) -> ToolDefinition {
        ToolDefinition {
            server: server.into(),
            name: name.into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn empty_manager() -> McpManager {
        McpManager {
            servers: BTreeMap::new(),
            catalog: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[test]
    fn config_parses_the_mcp_servers_shape() {
        let cfg: McpConfig = serde_json::from_value(json!({
            "mcpServers": {
                "files": {"command": "mcp-files", "args": ["--root", "/"]},
                "remote": {"url": "https://example.com/mcp"},
                "broken": {},
            }
        }))
        .unwrap();
        assert_eq!(cfg.mcp_servers.len(), 3);
        assert_eq!(cfg.mcp_servers["files"].command.as_deref(), Some("mcp-files"));
        assert!(cfg.mcp_servers["remote"].command.is_none());
    }

    #[test]
    fn missing_config_file_is_an_empty_config() {
        let cfg = McpConfig::load(Path::new("/nonexistent/mcp_servers.json")).unwrap();
        assert!(cfg.mcp_servers.is_empty());
    }

    #[test]
    fn earliest_registration_wins_a_collision() {
        let mut m = empty_manager();
        m.register_tool(tool("alpha", "search"));
        m.register_tool(tool("beta", "search"));
        assert_eq!(m.catalog.len(), 1);
        assert_eq!(m.index["search"], "alpha");
    }

    #[test]
    fn distinct_names_all_register() {
        let mut m = empty_manager();
        m.register_tool(tool("alpha", "search"));
        m.register_tool(tool("alpha", "fetch"));
        m.register_tool(tool("beta", "write"));
        assert_eq!(m.catalog.len(), 3);
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_not_found() {
        let m = empty_manager();
        let err = m.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(name) if name == "nope"));
    }
}
