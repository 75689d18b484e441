// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One supervised MCP server child process.
//!
//! The supervisor exclusively owns the child's lifecycle and stdin writer.
//! Any number of in-process callers can issue requests concurrently: each
//! outbound request gets a monotonically increasing integer id and a slot
//! in the pending table; the single stdout reader task resolves awaiters as
//! responses arrive. A timed-out request abandons its slot, so the eventual
//! late reply is dropped as an unknown id. When the child exits, every
//! pending awaiter fails with `ServerCrashed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::framing::{write_frame, FrameReader};
use crate::{McpError, ToolCallResult, ToolDefinition, PROTOCOL_VERSION};

/// Cold starts (npm installs, interpreter boot) can be slow.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);
pub const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);
pub const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Ceiling for the fallback JSON serialization of a result with no
/// content parts.
const RESULT_JSON_CAP: usize = 10 * 1024;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, McpError>>>;

pub struct McpServer {
    name: String,
    stdin: Mutex<ChildStdin>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
}

impl McpServer {
    /// Spawn the configured command and run the `initialize` handshake.
    ///
    /// The child inherits the daemon's environment with the config `env`
    /// merged on top. stderr is drained to the log so a chatty server
    /// cannot fill its pipe and stall.
    pub async fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning MCP server '{name}' ({command})"))?;

        let stdin = child
            .stdin
            .take()
            .context("failed to capture child stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture child stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to capture child stderr")?;

        let server = Arc::new(Self {
            name: name.to_string(),
            stdin: Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            child: Mutex::new(Some(child)),
        });

        // stderr drain task.
        {
            let name = server.name.clone();
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                }
            });
        }

        // Dedicated stdout reader: the only task touching the pending table
        // from the response side.
        {
            let name = server.name.clone();
            let pending = Arc::clone(&server.pending);
            let mut reader = FrameReader::new(stdout);
            tokio::spawn(async move {
                loop {
                    match reader.next_frame().await {
                        Ok(Some(frame)) => {
                            Self::dispatch_frame(&name, &pending, frame).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(server = %name, "stdout read error: {e}");
                            break;
                        }
                    }
                }
                // Child exited (or its pipe broke): fail all pending callers.
                let mut pending = pending.lock().await;
                if !pending.is_empty() {
                    warn!(
                        server = %name,
                        pending = pending.len(),
                        "server exited with requests in flight"
                    );
                }
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(McpError::ServerCrashed(name.clone())));
                }
            });
        }

        server.initialize().await?;
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch_frame(name: &str, pending: &Mutex<PendingMap>, frame: Value) {
        match frame.get("id").and_then(Value::as_u64) {
            Some(id) => {
                let tx = pending.lock().await.remove(&id);
                match tx {
                    Some(tx) => {
                        let outcome = if let Some(err) = frame.get("error") {
                            let msg = err["message"].as_str().unwrap_or("unknown error");
                            Err(McpError::Protocol(format!("{msg} ({})", err["code"])))
                        } else {
                            Ok(frame["result"].clone())
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        // Usually the late reply of a timed-out request.
                        warn!(server = %name, id, "response for unknown request id");
                    }
                }
            }
            None => {
                debug!(
                    server = %name,
                    method = frame["method"].as_str().unwrap_or(""),
                    "notification from server"
                );
            }
        }
    }

    /// Issue one request and await its response.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = write_frame(&mut *stdin, &frame).await {
                self.pending.lock().await.remove(&id);
                warn!(server = %self.name, method, "write to child failed: {e}");
                return Err(McpError::ServerCrashed(self.name.clone()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Reader task dropped the sender without resolving: child gone.
            Ok(Err(_)) => Err(McpError::ServerCrashed(self.name.clone())),
            Err(_) => {
                // Abandon the in-flight request; its eventual reply will be
                // dropped as an unknown id.
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Value) {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut stdin = self.stdin.lock().await;
        if let Err(e) = write_frame(&mut *stdin, &frame).await {
            warn!(server = %self.name, method, "notification write failed: {e}");
        }
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "bosun",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            INITIALIZE_TIMEOUT,
        )
        .await
        .with_context(|| format!("initializing MCP server '{}'", self.name))?;
        self.notify("notifications/initialized", json!({})).await;
        info!(server = %self.name, "initialized");
        Ok(())
    }

    /// Discover the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let result = self
            .request("tools/list", json!({}), LIST_TOOLS_TIMEOUT)
            .await?;
        let tools = result["tools"]
            .as_array()
            .ok_or_else(|| McpError::Protocol("tools/list result has no tools array".into()))?;
        Ok(tools
            .iter()
            .map(|t| ToolDefinition {
                server: self.name.clone(),
                name: t["name"].as_str().unwrap_or("").to_string(),
                description: t["description"].as_str().unwrap_or("").to_string(),
                input_schema: t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
            .filter(|t| !t.name.is_empty())
            .collect())
    }

    /// Invoke a tool. An error the tool reports about itself comes back as
    /// `is_error = true`; transport failures (timeout, crash) are `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let outcome = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                CALL_TOOL_TIMEOUT,
            )
            .await;
        match outcome {
            Ok(result) => Ok(normalize_result(&result)),
            // The server answered with a JSON-RPC error object: the call
            // reached the tool layer, so surface it as a tool error rather
            // than failing the caller.
            Err(McpError::Protocol(msg)) => Ok(ToolCallResult::error(msg)),
            Err(e) => Err(e),
        }
    }

    /// Kill the child. Pending requests fail through the reader task.
    pub async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(server = %self.name, "kill failed: {e}");
            }
        }
    }
}

/// Flatten a `tools/call` result into `{content, is_error}`.
///
/// Text parts are joined with newlines; image bytes are never inlined, and
/// resources are referenced by uri. A result with no content parts at all
/// is serialized wholesale, capped at 10 KiB.
pub fn normalize_result(result: &Value) -> ToolCallResult {
    let is_error = result["isError"].as_bool().unwrap_or(false);
    let parts: Vec<String> = result["content"]
        .as_array()
        .map(|content| {
            content
                .iter()
                .filter_map(|part| match part["type"].as_str().unwrap_or("") {
                    "text" => part["text"].as_str().map(str::to_string),
                    "image" => {
                        let mime = part["mimeType"].as_str().unwrap_or("image");
                        Some(format!("[Image returned: {mime}]"))
                    }
                    "resource" => {
                        let uri = part["resource"]["uri"].as_str().unwrap_or("unknown");
                        Some(format!("[Resource: {uri}]"))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let content = if parts.is_empty() {
        truncate(&result.to_string(), RESULT_JSON_CAP)
    } else {
        parts.join("\n")
    };
    ToolCallResult { content, is_error }
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}[...truncated]", &text[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── normalize_result ───────────────────────────────────────────────────

    #[test]
    fn text_parts_join_with_newlines() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"},
            ]
        });
        let out = normalize_result(&result);
        assert_eq!(out.content, "line one\nline two");
        assert!(!out.is_error);
    }

    #[test]
    fn image_parts_are_replaced_with_a_placeholder() {
        let result = json!({
            "content": [
                {"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"},
            ]
        });
        let out = normalize_result(&result);
        assert_eq!(out.content, "[Image returned: image/png]");
    }

    #[test]
    fn resource_parts_reference_the_uri() {
        let result = json!({
            "content": [
                {"type": "resource", "resource": {"uri": "file:///tmp/report.csv"}},
            ]
        });
        let out = normalize_result(&result);
        assert_eq!(out.content, "[Resource: file:///tmp/report.csv]");
    }

    #[test]
    fn is_error_flag_is_carried_through() {
        let result = json!({
            "isError": true,
            "content": [{"type": "text", "text": "no such file"}]
        });
        let out = normalize_result(&result);
        assert!(out.is_error);
        assert_eq!(out.content, "no such file");
    }

    #[test]
    fn empty_content_serializes_the_result_json() {
        let result = json!({"structured": {"answer": 42}});
        let out = normalize_result(&result);
        assert!(out.content.contains("\"answer\":42"));
    }

    #[test]
    fn oversized_fallback_is_truncated_with_marker() {
        let result = json!({"blob": "y".repeat(20 * 1024)});
        let out = normalize_result(&result);
        assert!(out.content.len() < 11 * 1024);
        assert!(out.content.ends_with("[...truncated]"));
    }

    #[test]
    fn unknown_part_types_are_skipped() {
        let result = json!({
            "content": [
                {"type": "audio", "data": "..."},
                {"type": "text", "text": "kept"},
            ]
        });
        assert_eq!(normalize_result(&result).content, "kept");
    }
}
