// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The workflow engine.
//!
//! A workflow is a user-defined DAG of tool invocations with variable
//! passing and a per-step error policy, started by a cron expression, an
//! event on the bus, or an explicit run command. Executions are durable:
//! every status transition is flushed to disk before it is broadcast, so a
//! crash loses at most the in-flight delta.

pub mod bus;
pub mod cron;
pub mod executor;
pub mod model;
pub mod notify;
pub mod service;
pub mod store;

pub use bus::{Event, EventBus};
pub use cron::{CronError, CronExpr, CronScheduler};
pub use executor::WorkflowExecutor;
pub use model::{
    Execution, ExecutionStatus, NotificationPrefs, OnError, Step, StepResult, StepStatus,
    TemplateValue, Trigger, WorkflowDefinition,
};
pub use notify::{NotificationType, Notifier};
pub use service::WorkflowService;
pub use store::{WorkflowStore, WorkflowSummary};
