// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable workflow definitions and execution records.
//!
//! Two directories, one JSON file per record, atomic rename on every
//! write. Listings tolerate absent directories and skip undecodable files.

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use bosun_store::atomic;

use crate::model::{Execution, WorkflowDefinition};

/// Default cap for [`WorkflowStore::list_executions`].
pub const DEFAULT_EXECUTION_LIMIT: usize = 20;

/// A definition joined with its most recent execution, for list views.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    #[serde(flatten)]
    pub definition: WorkflowDefinition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_execution: Option<Execution>,
}

pub struct WorkflowStore {
    definitions_dir: PathBuf,
    executions_dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(definitions_dir: impl Into<PathBuf>, executions_dir: impl Into<PathBuf>) -> Self {
        Self {
            definitions_dir: definitions_dir.into(),
            executions_dir: executions_dir.into(),
        }
    }

    fn definition_path(&self, id: &str) -> PathBuf {
        self.definitions_dir.join(format!("{id}.json"))
    }

    fn execution_path(&self, id: &str) -> PathBuf {
        self.executions_dir.join(format!("{id}.json"))
    }

    // ── Definitions ────────────────────────────────────────────────────────

    pub fn save_workflow(&self, workflow: &WorkflowDefinition) -> anyhow::Result<()> {
        atomic::write_json(&self.definition_path(&workflow.id), workflow)
    }

    pub fn load_workflow(&self, id: &str) -> anyhow::Result<WorkflowDefinition> {
        atomic::read_json(&self.definition_path(id))
    }

    pub fn delete_workflow(&self, id: &str) -> anyhow::Result<()> {
        let path = self.definition_path(id);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> = atomic::load_all(&self.definitions_dir);
        workflows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        workflows
    }

    /// Every definition joined with its latest execution.
    pub fn list_all(&self) -> Vec<WorkflowSummary> {
        let executions: Vec<Execution> = atomic::load_all(&self.executions_dir);
        self.list_workflows()
            .into_iter()
            .map(|definition| {
                let latest_execution = executions
                    .iter()
                    .filter(|e| e.workflow_id == definition.id)
                    .max_by_key(|e| e.started_at)
                    .cloned();
                WorkflowSummary {
                    definition,
                    latest_execution,
                }
            })
            .collect()
    }

    // ── Executions ─────────────────────────────────────────────────────────

    pub fn save_execution(&self, execution: &Execution) -> anyhow::Result<()> {
        debug!(
            execution = %execution.id,
            status = execution.status.as_str(),
            "flushing execution record"
        );
        atomic::write_json(&self.execution_path(&execution.id), execution)
    }

    pub fn load_execution(&self, id: &str) -> anyhow::Result<Execution> {
        atomic::read_json(&self.execution_path(id))
    }

    /// Executions of one workflow, newest first, capped at `limit`.
    pub fn list_executions(&self, workflow_id: &str, limit: Option<usize>) -> Vec<Execution> {
        let limit = limit.unwrap_or(DEFAULT_EXECUTION_LIMIT);
        let mut executions: Vec<Execution> = atomic::load_all(&self.executions_dir)
            .into_iter()
            .filter(|e: &Execution| e.workflow_id == workflow_id)
            .collect();
        executions.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        executions.truncate(limit);
        executions
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
