//! Event fan-out
//!
//! Worker notifications and lifecycle events are delivered to subscribers
//! registered by event name. Delivery is synchronous, in subscription
//! order, and a panicking handler never prevents the rest from running.

use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::supervisor::ExitInfo;

/// Subscribe under this name to receive every event
pub const ALL_EVENTS: &str = "*";

pub const EXIT_EVENT: &str = "exit";
pub const ERROR_EVENT: &str = "error";
pub const STDERR_EVENT: &str = "stderr";
pub const MALFORMED_EVENT: &str = "malformed";

/// Everything a subscriber can observe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A notification from the worker, published under its method name
    Notification {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// One line the worker wrote to stderr
    Stderr { line: String },
    /// The worker process is gone
    Exit(ExitInfo),
    /// A process-level failure or protocol violation
    Error { message: String },
    /// A stdout line that was not a valid message
    Malformed {
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<String>,
        reason: String,
    },
}

impl ClientEvent {
    /// Channel this event is published on
    pub fn name(&self) -> &str {
        match self {
            ClientEvent::Notification { method, .. } => method,
            ClientEvent::Stderr { .. } => STDERR_EVENT,
            ClientEvent::Exit(_) => EXIT_EVENT,
            ClientEvent::Error { .. } => ERROR_EVENT,
            ClientEvent::Malformed { .. } => MALFORMED_EVENT,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to `unsubscribe` to detach
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event: String,
}

impl SubscriptionHandle {
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Subscription {
    id: u64,
    event: String,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Cloneable handle to one set of subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for events named `event` ([`ALL_EVENTS`] for all)
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscriptions.push(Subscription {
            id,
            event: event.clone(),
            handler: Arc::new(handler),
        });
        SubscriptionHandle { id, event }
    }

    /// Detach a subscriber; returns false if it was already gone
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.lock();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != handle.id);
        registry.subscriptions.len() != before
    }

    /// Deliver `event` to every subscriber of `name`
    ///
    /// Returns how many handlers ran to completion.
    pub fn publish(&self, name: &str, event: &ClientEvent) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly
        let handlers: Vec<(u64, EventHandler)> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.event == name || s.event == ALL_EVENTS)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(subscription = id, event = name, "event handler panicked");
                }
            }
        }
        delivered
    }

    /// Publish under the event's own name
    pub fn emit(&self, event: ClientEvent) -> usize {
        let name = event.name().to_string();
        self.publish(&name, &event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}
