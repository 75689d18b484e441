// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Binds triggers to the executor.
//!
//! `sync` re-registers every enabled workflow: cron triggers get a
//! scheduling loop, event triggers get a bus subscription with the
//! workflow's filter. It is called at startup and again after every
//! create/update/delete, replacing the previous registrations wholesale —
//! late binding, so editing a workflow never requires a daemon restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{EventBus, EventHandler};
use crate::cron::{CronExpr, CronScheduler, FireCallback};
use crate::executor::WorkflowExecutor;
use crate::model::{Event, Trigger};
use crate::store::WorkflowStore;

pub struct WorkflowService {
    store: Arc<WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    scheduler: CronScheduler,
    bus: Arc<EventBus>,
    event_subscriptions: Mutex<Vec<String>>,
}

impl WorkflowService {
    pub fn new(
        store: Arc<WorkflowStore>,
        executor: Arc<WorkflowExecutor>,
        bus: Arc<EventBus>,
    ) -> Self {
        let callback: FireCallback = {
            let store = Arc::clone(&store);
            let executor = Arc::clone(&executor);
            Arc::new(move |workflow_id: String| {
                let store = Arc::clone(&store);
                let executor = Arc::clone(&executor);
                Box::pin(async move {
                    fire(&store, &executor, &workflow_id, None).await;
                })
            })
        };
        Self {
            store,
            executor,
            scheduler: CronScheduler::new(callback),
            bus,
            event_subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Re-register every enabled workflow's trigger, replacing whatever was
    /// registered before. A workflow whose cron expression fails to parse
    /// is logged and left unscheduled.
    pub async fn sync(&self) {
        let workflows = self.store.list_workflows();

        let mut jobs = Vec::new();
        for wf in workflows.iter().filter(|w| w.enabled) {
            if let Trigger::Cron { expression } = &wf.trigger {
                match CronExpr::parse(expression) {
                    Ok(expr) => jobs.push((wf.id.clone(), expr)),
                    Err(e) => {
                        warn!(workflow = %wf.name, cron = %expression, "refusing to schedule: {e}")
                    }
                }
            }
        }
        let cron_count = jobs.len();
        self.scheduler.schedule_all(jobs).await;

        {
            let mut subs = self.event_subscriptions.lock().await;
            for id in subs.drain(..) {
                self.bus.unsubscribe(&id).await;
            }
        }
        let mut event_count = 0;
        for wf in workflows.iter().filter(|w| w.enabled) {
            if let Trigger::Event {
                source,
                event_type,
                filter,
            } = &wf.trigger
            {
                let subscription_id = format!("workflow:{}", wf.id);
                self.bus
                    .subscribe(
                        &subscription_id,
                        source,
                        event_type,
                        self.event_handler(&wf.id, filter.clone()),
                    )
                    .await;
                self.event_subscriptions
                    .lock()
                    .await
                    .push(subscription_id);
                event_count += 1;
            }
        }
        info!(cron = cron_count, event = event_count, "trigger sync complete");
    }

    fn event_handler(&self, workflow_id: &str, filter: BTreeMap<String, String>) -> EventHandler {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let workflow_id = workflow_id.to_string();
        Arc::new(move |event: Event| {
            let store = Arc::clone(&store);
            let executor = Arc::clone(&executor);
            let workflow_id = workflow_id.clone();
            let filter = filter.clone();
            Box::pin(async move {
                if !filter_matches(&filter, &event) {
                    return;
                }
                let info = format!("event: {}:{}", event.source, event.event_type);
                fire(&store, &executor, &workflow_id, Some(info)).await;
            })
        })
    }

    /// Explicit run command. Returns the execution id.
    pub async fn run_now(&self, workflow_id: &str) -> anyhow::Result<String> {
        let workflow = self.store.load_workflow(workflow_id)?;
        self.executor.execute(workflow, "manual").await
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop_all().await;
    }
}

/// Load-then-execute shared by the cron callback and event handlers. The
/// definition is re-read at fire time so edits apply to the next firing.
async fn fire(
    store: &Arc<WorkflowStore>,
    executor: &Arc<WorkflowExecutor>,
    workflow_id: &str,
    trigger_info: Option<String>,
) {
    match store.load_workflow(workflow_id) {
        Ok(workflow) if workflow.enabled => {
            let info = trigger_info.unwrap_or_else(|| match &workflow.trigger {
                Trigger::Cron { expression } => format!("cron: {expression}"),
                Trigger::Event { .. } => "event".to_string(),
            });
            if let Err(e) = executor.execute(workflow, &info).await {
                warn!(workflow = %workflow_id, "trigger fired but execution failed to start: {e:#}");
            }
        }
        Ok(_) => {} // disabled since registration
        Err(e) => warn!(workflow = %workflow_id, "trigger fired for unloadable workflow: {e:#}"),
    }
}

/// Every filter key must equal the event's datum (string compare; non-
/// string data compares against its JSON rendering).
fn filter_matches(filter: &BTreeMap<String, String>, event: &Event) -> bool {
    filter.iter().all(|(key, expected)| {
        match event.data.get(key) {
            Some(Value::String(s)) => s == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let event = Event::new("mail", "received").with_data("from", "anyone");
        assert!(filter_matches(&BTreeMap::new(), &event));
    }

    #[test]
    fn string_values_compare_directly() {
        let filter = BTreeMap::from([("from".to_string(), "boss".to_string())]);
        assert!(filter_matches(
            &filter,
            &Event::new("mail", "received").with_data("from", "boss")
        ));
        assert!(!filter_matches(
            &filter,
            &Event::new("mail", "received").with_data("from", "peer")
        ));
    }

    #[test]
    fn missing_keys_do_not_match() {
        let filter = BTreeMap::from([("from".to_string(), "boss".to_string())]);
        assert!(!filter_matches(&filter, &Event::new("mail", "received")));
    }

    #[test]
    fn non_string_data_compares_against_its_json_form() {
        let filter = BTreeMap::from([("count".to_string(), "3".to_string())]);
        assert!(filter_matches(
            &filter,
            &Event::new("mail", "received").with_data("count", 3)
        ));
    }
}
