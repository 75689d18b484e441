// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runs one workflow execution: topological order, variable substitution,
//! per-step error policy.
//!
//! Steps run strictly sequentially. The execution record is flushed to
//! disk after every status transition and each transition is broadcast, so
//! clients watch progress live and a crash loses at most the in-flight
//! delta. A dependency cycle fails the execution before any step runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bosun_mcp::ToolInvoker;
use bosun_node::{Envelope, EventSink};

use crate::bus::EventBus;
use crate::model::{
    Event, Execution, ExecutionStatus, OnError, Step, StepStatus, TemplateValue,
    WorkflowDefinition,
};
use crate::notify::{NotificationType, Notifier};
use crate::store::WorkflowStore;

pub struct WorkflowExecutor {
    tools: Arc<dyn ToolInvoker>,
    store: Arc<WorkflowStore>,
    sink: Arc<dyn EventSink>,
    notifier: Notifier,
    bus: Arc<EventBus>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WorkflowExecutor {
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        store: Arc<WorkflowStore>,
        sink: Arc<dyn EventSink>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tools,
            store,
            notifier: Notifier::new(Arc::clone(&sink)),
            sink,
            bus,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Create the execution record (all steps pending), persist it, and
    /// start the run task. Returns the execution id immediately.
    pub async fn execute(
        self: &Arc<Self>,
        workflow: WorkflowDefinition,
        trigger_info: &str,
    ) -> anyhow::Result<String> {
        let execution = Execution::new(&workflow, trigger_info);
        self.store.save_execution(&execution)?;

        let id = execution.id.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                this.run(workflow, execution).await;
                this.running.lock().await.remove(&id);
            }
        });
        self.running.lock().await.insert(id.clone(), handle);
        Ok(id)
    }

    /// Await a running execution. Used by callers that need the terminal
    /// record rather than live updates.
    pub async fn wait(&self, execution_id: &str) {
        let handle = self.running.lock().await.remove(execution_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Abort a running execution. The current step is abandoned; the
    /// record is marked `cancelled` with `completedAt` set.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let handle = self.running.lock().await.remove(execution_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        info!(execution = %execution_id, "execution cancelled");

        if let Ok(mut execution) = self.store.load_execution(execution_id) {
            if !execution.status.is_terminal() {
                execution.finish(ExecutionStatus::Cancelled);
                if let Err(e) = self.store.save_execution(&execution) {
                    warn!(execution = %execution_id, "failed to flush cancellation: {e:#}");
                }
                self.broadcast_done(&execution).await;
            }
        }
        true
    }

    async fn run(&self, workflow: WorkflowDefinition, mut execution: Execution) {
        execution.status = ExecutionStatus::Running;
        self.flush(&execution);
        self.sink
            .broadcast(
                Envelope::new("workflow_execution_started")
                    .with_meta("workflowId", workflow.id.as_str())
                    .with_meta("executionId", execution.id.as_str())
                    .with_meta("workflowName", workflow.name.as_str())
                    .with_meta("triggerInfo", execution.trigger_info.as_str()),
            )
            .await;
        self.notifier
            .notify(
                &workflow.notification_prefs,
                NotificationType::Started,
                &workflow.id,
                &execution.id,
                &workflow.name,
                "Workflow started",
            )
            .await;

        let Some(order) = topological_order(&workflow.steps) else {
            warn!(workflow = %workflow.name, "dependency graph has a cycle, failing execution");
            self.finish_failed(&workflow, &mut execution, "dependency graph has a cycle")
                .await;
            return;
        };

        let mut outputs: HashMap<String, String> = HashMap::new();
        for step in &order {
            self.update_step(&mut execution, &step.id, |r| {
                r.status = StepStatus::Running;
                r.started_at = Some(chrono::Utc::now());
            })
            .await;

            let arguments = resolve_inputs(&step.input_template, &outputs);
            let mut outcome = self.attempt(step, arguments.clone()).await;

            // The retry budget is exactly one extra attempt, after which the
            // policy degrades to stop.
            if outcome.is_err() && step.on_error == OnError::Retry {
                info!(step = %step.name, "step failed, retrying once");
                outcome = self.attempt(step, arguments).await;
            }

            match outcome {
                Ok(output) => {
                    outputs.insert(step.id.clone(), output.clone());
                    self.update_step(&mut execution, &step.id, |r| {
                        r.status = StepStatus::Success;
                        r.output = Some(output.clone());
                        r.completed_at = Some(chrono::Utc::now());
                    })
                    .await;
                    self.notifier
                        .notify(
                            &workflow.notification_prefs,
                            NotificationType::StepCompleted,
                            &workflow.id,
                            &execution.id,
                            &workflow.name,
                            format!("Step '{}' completed", step.name),
                        )
                        .await;
                }
                Err(error) if step.on_error == OnError::Skip => {
                    warn!(step = %step.name, "step failed, skipping: {error}");
                    self.update_step(&mut execution, &step.id, |r| {
                        r.status = StepStatus::Skipped;
                        r.error = Some(error.clone());
                        r.completed_at = Some(chrono::Utc::now());
                    })
                    .await;
                }
                Err(error) => {
                    warn!(step = %step.name, "step failed, stopping: {error}");
                    self.update_step(&mut execution, &step.id, |r| {
                        r.status = StepStatus::Error;
                        r.error = Some(error.clone());
                        r.completed_at = Some(chrono::Utc::now());
                    })
                    .await;
                    self.finish_failed(&workflow, &mut execution, &error).await;
                    return;
                }
            }
        }

        execution.finish(ExecutionStatus::Completed);
        self.flush(&execution);
        self.broadcast_done(&execution).await;
        self.notifier
            .notify(
                &workflow.notification_prefs,
                NotificationType::Completed,
                &workflow.id,
                &execution.id,
                &workflow.name,
                "Workflow completed",
            )
            .await;
        self.publish_lifecycle(&workflow, &execution, "completed").await;
    }

    /// One tool invocation, flattened to output-or-error. A tool that ran
    /// and reported failure and a transport error are both step errors.
    async fn attempt(&self, step: &Step, arguments: Value) -> Result<String, String> {
        match self.tools.call_tool(&step.tool_name, arguments).await {
            Ok(result) if result.is_error => Err(result.content),
            Ok(result) => Ok(result.content),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn update_step(
        &self,
        execution: &mut Execution,
        step_id: &str,
        apply: impl FnOnce(&mut crate::model::StepResult),
    ) {
        let (result_step_id, result_step_name, result_status) = {
            let Some(result) = execution.step_mut(step_id) else {
                return;
            };
            apply(result);
            (
                result.step_id.clone(),
                result.step_name.clone(),
                result.status.as_str().to_string(),
            )
        };
        let envelope = Envelope::new("workflow_step_update")
            .with_meta("workflowId", execution.workflow_id.as_str())
            .with_meta("executionId", execution.id.as_str())
            .with_meta("stepId", result_step_id.as_str())
            .with_meta("stepName", result_step_name.as_str())
            .with_meta("status", result_status.as_str());
        self.flush(execution);
        self.sink.broadcast(envelope).await;
    }

    async fn finish_failed(
        &self,
        workflow: &WorkflowDefinition,
        execution: &mut Execution,
        error: &str,
    ) {
        execution.finish(ExecutionStatus::Failed);
        self.flush(execution);
        self.broadcast_done(execution).await;
        self.notifier
            .notify(
                &workflow.notification_prefs,
                NotificationType::Failed,
                &workflow.id,
                &execution.id,
                &workflow.name,
                format!("Workflow failed: {error}"),
            )
            .await;
        self.publish_lifecycle(workflow, execution, "failed").await;
    }

    async fn broadcast_done(&self, execution: &Execution) {
        self.sink
            .broadcast(
                Envelope::new("workflow_execution_done")
                    .with_meta("workflowId", execution.workflow_id.as_str())
                    .with_meta("executionId", execution.id.as_str())
                    .with_meta("status", execution.status.as_str()),
            )
            .await;
    }

    /// Terminal states also go out on the event bus, so workflows can
    /// chain on each other's completion.
    async fn publish_lifecycle(
        &self,
        workflow: &WorkflowDefinition,
        execution: &Execution,
        event_type: &str,
    ) {
        self.bus
            .publish(
                Event::new("workflow", event_type)
                    .with_data("workflowId", workflow.id.as_str())
                    .with_data("workflowName", workflow.name.as_str())
                    .with_data("executionId", execution.id.as_str()),
            )
            .await;
    }

    fn flush(&self, execution: &Execution) {
        if let Err(e) = self.store.save_execution(execution) {
            warn!(execution = %execution.id, "failed to flush execution record: {e:#}");
        }
    }
}

/// Kahn's algorithm over `dependsOn`. Among ready steps, definition order
/// is preserved. Returns `None` when the graph has a cycle or a dependency
/// that names no step — in both cases no valid order exists.
fn topological_order(steps: &[Step]) -> Option<Vec<Step>> {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        indegree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return None;
            }
            *indegree.entry(step.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = steps
        .iter()
        .filter(|s| indegree[s.id.as_str()] == 0)
        .map(|s| s.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = ready.pop_front() {
        order.push((*by_id[id]).clone());
        for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            let count = indegree.get_mut(dependent).expect("dependent is indexed");
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent);
            }
        }
    }

    (order.len() == steps.len()).then_some(order)
}

/// Substitute an input template against the outputs of completed
/// predecessors. Every resolved value is a string; unsatisfied variable
/// references resolve to the empty string.
fn resolve_inputs(
    template: &std::collections::BTreeMap<String, TemplateValue>,
    outputs: &HashMap<String, String>,
) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in template {
        let resolved = match value {
            TemplateValue::Literal { value } => value.clone(),
            TemplateValue::Variable { step_id, path } => {
                resolve_variable(step_id, path, outputs)
            }
        };
        object.insert(key.clone(), Value::String(resolved));
    }
    Value::Object(object)
}

fn resolve_variable(step_id: &str, path: &str, outputs: &HashMap<String, String>) -> String {
    let Some(raw) = outputs.get(step_id) else {
        return String::new();
    };
    if path.is_empty() {
        return raw.clone();
    }
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return String::new();
    };
    let mut current = &parsed;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
