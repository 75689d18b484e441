// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process event bus keyed on `source:eventType`.
//!
//! Handlers are registered under a stable subscription id and invoked
//! sequentially, in registration order, each awaited before the next.
//! Handlers must not block indefinitely; that is a contract with the
//! subscriber, not something the bus enforces.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

pub use crate::model::Event;

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<(String, EventHandler)>>>,
}

fn key(source: &str, event_type: &str) -> String {
    format!("{source}:{event_type}")
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `source:event_type` under `subscription_id`.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        source: &str,
        event_type: &str,
        handler: EventHandler,
    ) {
        self.handlers
            .lock()
            .await
            .entry(key(source, event_type))
            .or_default()
            .push((subscription_id.to_string(), handler));
        debug!(id = %subscription_id, key = %key(source, event_type), "subscribed");
    }

    /// Remove the subscription id from every key.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let mut handlers = self.handlers.lock().await;
        for list in handlers.values_mut() {
            list.retain(|(id, _)| id != subscription_id);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Dispatch to every handler registered for the event's key, awaiting
    /// each in registration order.
    pub async fn publish(&self, event: Event) {
        let matching: Vec<EventHandler> = {
            let handlers = self.handlers.lock().await;
            handlers
                .get(&key(&event.source, &event.event_type))
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        debug!(
            source = %event.source,
            event_type = %event.event_type,
            handlers = matching.len(),
            "publishing event"
        );
        for handler in matching {
            handler(event.clone()).await;
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.handlers
            .lock()
            .await
            .values()
            .map(|list| list.len())
            .sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_handler(log: Arc<StdMutex<Vec<String>>>, tag: &str) -> EventHandler {
        let tag = tag.to_string();
        Arc::new(move |event: Event| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{tag}:{}", event.event_type));
            })
        })
    }

    #[tokio::test]
    async fn publish_reaches_matching_handlers_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("s1", "mail", "received", recording_handler(log.clone(), "first"))
            .await;
        bus.subscribe("s2", "mail", "received", recording_handler(log.clone(), "second"))
            .await;

        bus.publish(Event::new("mail", "received")).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:received".to_string(), "second:received".to_string()]
        );
    }

    #[tokio::test]
    async fn non_matching_keys_are_not_invoked() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("s1", "mail", "received", recording_handler(log.clone(), "h"))
            .await;

        bus.publish(Event::new("mail", "sent")).await;
        bus.publish(Event::new("calendar", "received")).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_id_from_every_key() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("sub", "a", "x", recording_handler(log.clone(), "ax"))
            .await;
        bus.subscribe("sub", "b", "y", recording_handler(log.clone(), "by"))
            .await;
        bus.subscribe("other", "a", "x", recording_handler(log.clone(), "keep"))
            .await;

        bus.unsubscribe("sub").await;
        assert_eq!(bus.subscription_count().await, 1);

        bus.publish(Event::new("a", "x")).await;
        bus.publish(Event::new("b", "y")).await;
        assert_eq!(*log.lock().unwrap(), vec!["keep:x".to_string()]);
    }

    #[tokio::test]
    async fn event_data_reaches_the_handler() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            bus.subscribe(
                "s",
                "mail",
                "received",
                Arc::new(move |event: Event| {
                    let log = Arc::clone(&log);
                    Box::pin(async move {
                        let from = event.data["from"].as_str().unwrap().to_string();
                        log.lock().unwrap().push(from);
                    })
                }),
            )
            .await;
        }
        bus.publish(Event::new("mail", "received").with_data("from", "boss"))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["boss".to_string()]);
    }
}
