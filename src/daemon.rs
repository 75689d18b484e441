// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Daemon composition root and the WebSocket envelope dispatcher.
//!
//! Everything with process lifetime is constructed here at startup: the
//! MCP manager, the stores, the chat engine, the workflow service, and the
//! hub. The daemon itself is the hub's message handler — one `match` over
//! the client-to-server envelope types.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use bosun_config::{load_skills, Paths};
use bosun_core::ChatEngine;
use bosun_mcp::{McpConfig, McpManager, ToolInvoker};
use bosun_model::{client::complete_text, AnthropicClient, ChatProvider};
use bosun_node::{Envelope, EventSink, Hub, MessageHandler};
use bosun_store::{Conversation, ConversationStore};
use bosun_workflow::{
    CronExpr, EventBus, NotificationPrefs, Step, Trigger, WorkflowDefinition, WorkflowExecutor,
    WorkflowService, WorkflowStore,
};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Daemon {
    hub: Arc<Hub>,
    engine: Arc<ChatEngine>,
    provider: Option<Arc<dyn ChatProvider>>,
    conversations: Arc<ConversationStore>,
    workflows: Arc<WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    service: Arc<WorkflowService>,
    mcp: Arc<McpManager>,
}

impl Daemon {
    /// Construct every component and register the envelope handler.
    pub async fn start(paths: Paths) -> anyhow::Result<Arc<Self>> {
        paths.ensure_layout().context("creating state directory")?;

        let mcp_config =
            McpConfig::load(&paths.mcp_servers_file()).context("reading MCP server config")?;
        let mcp = Arc::new(McpManager::start(mcp_config).await);
        info!(
            servers = mcp.active_server_names().len(),
            tools = mcp.tool_definitions().len(),
            "MCP servers online"
        );

        let api_key = bosun_config::api_key(&paths);
        let provider: Option<Arc<dyn ChatProvider>> =
            api_key.map(|key| Arc::new(AnthropicClient::new(key, None, None)) as _);

        let hub = Hub::new();
        let conversations = Arc::new(ConversationStore::new(paths.conversations_dir()));
        let workflows = Arc::new(WorkflowStore::new(
            paths.workflows_dir(),
            paths.executions_dir(),
        ));
        let bus = Arc::new(EventBus::new());
        let executor = WorkflowExecutor::new(
            mcp.clone() as Arc<dyn ToolInvoker>,
            Arc::clone(&workflows),
            hub.clone() as Arc<dyn EventSink>,
            Arc::clone(&bus),
        );
        let service = Arc::new(WorkflowService::new(
            Arc::clone(&workflows),
            Arc::clone(&executor),
            bus,
        ));
        service.sync().await;

        let engine = Arc::new(ChatEngine::new(
            Arc::clone(&conversations),
            mcp.clone() as Arc<dyn ToolInvoker>,
            provider.clone(),
            hub.clone() as Arc<dyn EventSink>,
            Some(system_prompt(&paths)),
        ));

        let daemon = Arc::new(Self {
            hub: Arc::clone(&hub),
            engine,
            provider,
            conversations,
            workflows,
            executor,
            service,
            mcp,
        });
        hub.set_handler(daemon.clone());
        Ok(daemon)
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        self.service.shutdown().await;
        self.mcp.stop_all().await;
    }

    // ── Reply helpers ──────────────────────────────────────────────────────

    async fn reply(&self, client_id: u64, envelope: Envelope) {
        self.hub.send_to(client_id, &envelope).await;
    }

    async fn reply_error(&self, client_id: u64, message: impl Into<String>) {
        self.reply(client_id, Envelope::error(message, "REQUEST_FAILED"))
            .await;
    }

    async fn reply_json(&self, client_id: u64, kind: &str, value: &impl serde::Serialize) {
        match serde_json::to_string(value) {
            Ok(text) => {
                self.reply(client_id, Envelope::new(kind).with_content(text))
                    .await
            }
            Err(e) => self.reply_error(client_id, format!("encoding reply: {e}")).await,
        }
    }

    // ── Conversations ──────────────────────────────────────────────────────

    async fn handle_new_conversation(&self, client_id: u64, envelope: Envelope) {
        let mut conversation = Conversation::new();
        if let Some(title) = envelope.content {
            conversation.title = title;
        }
        match self.conversations.save(&conversation) {
            Ok(()) => {
                self.hub
                    .broadcast(
                        Envelope::new("conversation_created")
                            .with_conversation(&conversation.id)
                            .with_content(&conversation.title),
                    )
                    .await;
            }
            Err(e) => self.reply_error(client_id, format!("creating conversation: {e:#}")).await,
        }
    }

    async fn handle_load_conversation(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.conversation_id else {
            return self.reply_error(client_id, "load_conversation requires conversationId").await;
        };
        match self.conversations.load(&id) {
            Ok(conversation) => {
                let reply = match serde_json::to_string(&conversation) {
                    Ok(text) => Envelope::new("conversation_loaded")
                        .with_conversation(&id)
                        .with_content(text),
                    Err(e) => Envelope::error(format!("encoding conversation: {e}"), "REQUEST_FAILED"),
                };
                self.reply(client_id, reply).await;
            }
            Err(e) => self.reply_error(client_id, format!("loading conversation: {e:#}")).await,
        }
    }

    async fn handle_list_conversations(&self, client_id: u64) {
        let summaries: Vec<Value> = self
            .conversations
            .list()
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "title": c.title,
                    "created": c.created,
                    "lastActivity": c.last_activity(),
                    "messageCount": c.messages.len(),
                })
            })
            .collect();
        self.reply_json(client_id, "conversation_list", &summaries).await;
    }

    async fn handle_delete_conversation(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.conversation_id else {
            return self.reply_error(client_id, "delete_conversation requires conversationId").await;
        };
        match self.conversations.delete(&id) {
            Ok(()) => {
                self.hub
                    .broadcast(Envelope::new("conversation_deleted").with_conversation(&id))
                    .await;
            }
            Err(e) => self.reply_error(client_id, format!("deleting conversation: {e:#}")).await,
        }
    }

    // ── Workflows ──────────────────────────────────────────────────────────

    async fn handle_create_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(content) = envelope.content else {
            return self.reply_error(client_id, "create_workflow requires a definition").await;
        };
        let draft: WorkflowDraft = match serde_json::from_str(&content) {
            Ok(d) => d,
            Err(e) => return self.reply_error(client_id, format!("invalid workflow: {e}")).await,
        };
        let workflow = draft.into_definition();
        if let Err(e) = self.workflows.save_workflow(&workflow) {
            return self.reply_error(client_id, format!("saving workflow: {e:#}")).await;
        }
        self.service.sync().await;
        self.broadcast_workflow_event("workflow_created", &workflow).await;
    }

    async fn handle_update_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(content) = envelope.content else {
            return self.reply_error(client_id, "update_workflow requires a definition").await;
        };
        let mut workflow: WorkflowDefinition = match serde_json::from_str(&content) {
            Ok(w) => w,
            Err(e) => return self.reply_error(client_id, format!("invalid workflow: {e}")).await,
        };
        if self.workflows.load_workflow(&workflow.id).is_err() {
            return self.reply_error(client_id, format!("no workflow {}", workflow.id)).await;
        }
        workflow.updated = chrono::Utc::now();
        if let Err(e) = self.workflows.save_workflow(&workflow) {
            return self.reply_error(client_id, format!("saving workflow: {e:#}")).await;
        }
        self.service.sync().await;
        self.broadcast_workflow_event("workflow_updated", &workflow).await;
    }

    async fn handle_delete_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "delete_workflow requires an id").await;
        };
        match self.workflows.delete_workflow(&id) {
            Ok(()) => {
                self.service.sync().await;
                self.hub
                    .broadcast(Envelope::new("workflow_deleted").with_id(&id))
                    .await;
            }
            Err(e) => self.reply_error(client_id, format!("deleting workflow: {e:#}")).await,
        }
    }

    async fn broadcast_workflow_event(&self, kind: &str, workflow: &WorkflowDefinition) {
        let envelope = match serde_json::to_string(workflow) {
            Ok(text) => Envelope::new(kind).with_id(&workflow.id).with_content(text),
            Err(_) => Envelope::new(kind).with_id(&workflow.id),
        };
        self.hub.broadcast(envelope).await;
    }

    async fn handle_run_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "run_workflow requires an id").await;
        };
        if let Err(e) = self.service.run_now(&id).await {
            self.reply_error(client_id, format!("starting workflow: {e:#}")).await;
        }
        // Progress arrives via the workflow_execution_* broadcasts.
    }

    async fn handle_cancel_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "cancel_workflow requires an execution id").await;
        };
        if !self.executor.cancel(&id).await {
            self.reply_error(client_id, format!("no running execution {id}")).await;
        }
    }

    async fn handle_list_executions(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "list_executions requires a workflow id").await;
        };
        let limit = envelope
            .metadata
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize);
        let executions = self.workflows.list_executions(&id, limit);
        self.reply_json(client_id, "execution_list", &executions).await;
    }

    async fn handle_get_execution(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "get_execution requires an id").await;
        };
        match self.workflows.load_execution(&id) {
            Ok(execution) => self.reply_json(client_id, "execution_detail", &execution).await,
            Err(e) => self.reply_error(client_id, format!("loading execution: {e:#}")).await,
        }
    }

    async fn handle_get_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(id) = envelope.id else {
            return self.reply_error(client_id, "get_workflow requires an id").await;
        };
        match self.workflows.load_workflow(&id) {
            Ok(workflow) => self.reply_json(client_id, "workflow_detail", &workflow).await,
            Err(e) => self.reply_error(client_id, format!("loading workflow: {e:#}")).await,
        }
    }

    // ── Tooling and helpers ────────────────────────────────────────────────

    async fn handle_mcp_tools_list(&self, client_id: u64) {
        let tools: Vec<Value> = self
            .mcp
            .tool_definitions()
            .into_iter()
            .map(|t| {
                json!({
                    "server": t.server,
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();
        self.reply_json(client_id, "mcp_tools_list_result", &tools).await;
    }

    async fn handle_parse_schedule(&self, client_id: u64, envelope: Envelope) {
        let Some(expression) = envelope.content else {
            return self.reply_error(client_id, "parse_schedule requires an expression").await;
        };
        let reply = match CronExpr::parse(&expression) {
            Ok(expr) => {
                let mut fires = Vec::new();
                let mut t = chrono::Local::now();
                for _ in 0..3 {
                    match expr.next_fire(t) {
                        Some(next) => {
                            fires.push(next.to_rfc3339());
                            t = next;
                        }
                        None => break,
                    }
                }
                Envelope::new("parse_schedule_result")
                    .with_content(expression)
                    .with_meta("valid", true)
                    .with_meta("description", expr.describe())
                    .with_meta("nextFires", Value::Array(fires.into_iter().map(Value::String).collect()))
            }
            Err(e) => Envelope::new("parse_schedule_result")
                .with_content(expression)
                .with_meta("valid", false)
                .with_meta("error", e.to_string()),
        };
        self.reply(client_id, reply).await;
    }

    /// Draft a workflow definition from a natural-language request with a
    /// single tool-free model turn. The draft is returned, not saved. The
    /// model call can take a while, so the work is spawned off the client's
    /// receive loop.
    async fn handle_build_workflow(&self, client_id: u64, envelope: Envelope) {
        let Some(request) = envelope.content else {
            return self.reply_error(client_id, "build_workflow requires a description").await;
        };
        let Some(provider) = self.provider.clone() else {
            return self.reply(client_id, Envelope::error("no api key", "NO_API_KEY")).await;
        };
        let catalog = self.mcp.tool_definitions();
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let reply = build_workflow_draft(provider, catalog, &request).await;
            hub.send_to(client_id, &reply).await;
        });
    }
}

/// The model call behind `build_workflow`.
async fn build_workflow_draft(
    provider: Arc<dyn ChatProvider>,
    catalog: Vec<bosun_mcp::ToolDefinition>,
    request: &str,
) -> Envelope {
    let tools: Vec<Value> = catalog
        .into_iter()
        .map(|t| json!({"name": t.name, "server": t.server, "description": t.description}))
        .collect();
    let system = format!(
        "You translate a user's automation request into a workflow definition.\n\
         Available tools:\n{}\n\
         Respond with ONLY a JSON object of this shape:\n\
         {{\"name\": string, \"description\": string, \"trigger\": \
         {{\"type\": \"cron\", \"expression\": \"m h dom mon dow\"}} | \
         {{\"type\": \"event\", \"source\": string, \"eventType\": string, \"filter\": {{}}}}, \
         \"steps\": [{{\"id\": string, \"name\": string, \"toolName\": string, \
         \"serverName\": string, \"inputTemplate\": {{key: {{\"type\": \"literal\", \
         \"value\": string}} | {{\"type\": \"variable\", \"stepId\": string, \
         \"path\": string}}}}, \"dependsOn\": [string], \"onError\": \
         \"stop\"|\"skip\"|\"retry\"}}]}}",
        serde_json::to_string_pretty(&tools).unwrap_or_default()
    );

    match complete_text(provider.as_ref(), Some(system), request).await {
        Ok(text) => {
            let json_text = strip_code_fences(&text);
            match serde_json::from_str::<WorkflowDraft>(json_text) {
                Ok(draft) => {
                    let workflow = draft.into_definition();
                    match serde_json::to_string(&workflow) {
                        Ok(body) => Envelope::new("build_workflow_result").with_content(body),
                        Err(e) => {
                            Envelope::error(format!("encoding draft: {e}"), "REQUEST_FAILED")
                        }
                    }
                }
                Err(e) => {
                    warn!("build_workflow produced unparseable JSON: {e}");
                    Envelope::error(format!("could not build workflow: {e}"), "REQUEST_FAILED")
                }
            }
        }
        Err(e) => Envelope::error(format!("build_workflow failed: {e:#}"), "REQUEST_FAILED"),
    }
}

#[async_trait]
impl MessageHandler for Daemon {
    async fn on_connect(&self, client_id: u64) {
        let status = Envelope::new("status")
            .with_meta("connected", true)
            .with_meta("hasApiKey", self.engine.has_provider())
            .with_meta("toolCount", self.mcp.tool_definitions().len())
            .with_meta("daemonVersion", DAEMON_VERSION);
        self.hub.send_to(client_id, &status).await;
    }

    async fn on_message(&self, client_id: u64, envelope: Envelope) {
        match envelope.kind.as_str() {
            "user_message" => {
                let (Some(conversation_id), Some(content)) =
                    (envelope.conversation_id.clone(), envelope.content.clone())
                else {
                    return self
                        .reply_error(client_id, "user_message requires conversationId and content")
                        .await;
                };
                // The turn can run for minutes; never block this client's
                // receive loop on it. Per-conversation ordering is enforced
                // inside the engine.
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Err(e) = engine.handle_user_message(&conversation_id, &content).await {
                        warn!(conversation = %conversation_id, "turn error: {e:#}");
                    }
                });
            }
            "new_conversation" => self.handle_new_conversation(client_id, envelope).await,
            "load_conversation" => self.handle_load_conversation(client_id, envelope).await,
            "delete_conversation" => self.handle_delete_conversation(client_id, envelope).await,
            "list_conversations" => self.handle_list_conversations(client_id).await,
            "create_workflow" => self.handle_create_workflow(client_id, envelope).await,
            "update_workflow" => self.handle_update_workflow(client_id, envelope).await,
            "delete_workflow" => self.handle_delete_workflow(client_id, envelope).await,
            "list_workflows" => {
                self.reply_json(client_id, "workflow_list", &self.workflows.list_all())
                    .await
            }
            "get_workflow" => self.handle_get_workflow(client_id, envelope).await,
            "run_workflow" => self.handle_run_workflow(client_id, envelope).await,
            "cancel_workflow" => self.handle_cancel_workflow(client_id, envelope).await,
            "list_executions" => self.handle_list_executions(client_id, envelope).await,
            "get_execution" => self.handle_get_execution(client_id, envelope).await,
            "mcp_tools_list" => self.handle_mcp_tools_list(client_id).await,
            "parse_schedule" => self.handle_parse_schedule(client_id, envelope).await,
            "build_workflow" => self.handle_build_workflow(client_id, envelope).await,
            other => {
                self.reply(
                    client_id,
                    Envelope::error(format!("unknown message type: {other}"), "INVALID_MESSAGE"),
                )
                .await;
            }
        }
    }
}

/// Base system prompt plus any user-authored skills.
fn system_prompt(paths: &Paths) -> String {
    let base = "You are bosun, a personal assistant daemon running on the \
                user's own machine. You can call the tools provided by the \
                connected MCP servers. Be concise; the user is reading on a \
                phone.";
    let skills = load_skills(&paths.skills_dir());
    if skills.is_empty() {
        base.to_string()
    } else {
        format!("{base}\n\n{skills}")
    }
}

/// Incoming `create_workflow` payload: everything the daemon fills in
/// (id, timestamps) is absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    trigger: Trigger,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    notification_prefs: NotificationPrefs,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDraft {
    fn into_definition(self) -> WorkflowDefinition {
        let mut workflow = WorkflowDefinition::new(self.name, self.trigger);
        workflow.description = self.description;
        workflow.enabled = self.enabled;
        workflow.steps = self.steps;
        workflow.notification_prefs = self.notification_prefs;
        workflow
    }
}

/// Models love to wrap JSON in markdown fences; strip them.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
