// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workflow lifecycle notifications fanned out over the WebSocket.
//!
//! Best effort by design: an envelope dropped because no client is
//! listening (or one was too slow) is acceptable, the execution record on
//! disk remains the source of truth.

use std::sync::Arc;

use bosun_node::{Envelope, EventSink};

use crate::model::NotificationPrefs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Started,
    Completed,
    Failed,
    StepCompleted,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::StepCompleted => "stepCompleted",
        }
    }

    fn enabled(self, prefs: &NotificationPrefs) -> bool {
        match self {
            Self::Started => prefs.on_start,
            Self::Completed => prefs.on_complete,
            Self::Failed => prefs.on_failure,
            Self::StepCompleted => prefs.on_step_complete,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Emit a `workflow_notification` envelope if the workflow's prefs
    /// allow this event type.
    pub async fn notify(
        &self,
        prefs: &NotificationPrefs,
        kind: NotificationType,
        workflow_id: &str,
        execution_id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) {
        if !kind.enabled(prefs) {
            return;
        }
        self.sink
            .broadcast(
                Envelope::new("workflow_notification")
                    .with_meta("title", title.into())
                    .with_meta("body", body.into())
                    .with_meta("workflowId", workflow_id)
                    .with_meta("executionId", execution_id)
                    .with_meta("notificationType", kind.as_str()),
            )
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn broadcast(&self, envelope: Envelope) {
            self.events.lock().await.push(envelope);
        }
    }

    fn all_on() -> NotificationPrefs {
        NotificationPrefs {
            on_start: true,
            on_complete: true,
            on_failure: true,
            on_step_complete: true,
        }
    }

    #[tokio::test]
    async fn notification_carries_the_full_metadata() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());
        notifier
            .notify(
                &all_on(),
                NotificationType::Completed,
                "wf-1",
                "ex-1",
                "digest",
                "Workflow completed",
            )
            .await;

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "workflow_notification");
        assert_eq!(events[0].metadata["workflowId"], "wf-1");
        assert_eq!(events[0].metadata["executionId"], "ex-1");
        assert_eq!(events[0].metadata["notificationType"], "completed");
        assert_eq!(events[0].metadata["title"], "digest");
    }

    #[tokio::test]
    async fn disabled_event_types_are_suppressed() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());
        let prefs = NotificationPrefs::default(); // start + step off

        notifier
            .notify(&prefs, NotificationType::Started, "w", "e", "t", "b")
            .await;
        notifier
            .notify(&prefs, NotificationType::StepCompleted, "w", "e", "t", "b")
            .await;
        assert!(sink.events.lock().await.is_empty());

        notifier
            .notify(&prefs, NotificationType::Failed, "w", "e", "t", "b")
            .await;
        assert_eq!(sink.events.lock().await.len(), 1);
    }
}
