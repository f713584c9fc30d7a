//! In-process publish/subscribe for lifecycle events.
//!
//! Subscribers are registered per [`EventKind`] while the agent is being
//! assembled; after that the bus is shared read-only. Publishing awaits each
//! subscriber in registration order and logs failures without propagating
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::lifecycle::{EventKind, LifecycleEvent, Operation, Transition};
use crate::io::coordinator::Coordinator;

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> Result<()>;
}

#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<Arc<dyn Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.entry(kind).or_default().push(subscriber);
    }

    /// Register one subscriber for every event kind.
    pub fn subscribe_all(&mut self, subscriber: Arc<dyn Subscriber>) {
        for kind in EventKind::ALL {
            self.subscribe(kind, Arc::clone(&subscriber));
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver to every subscriber of the event's kind. Returns the number of
    /// subscribers that failed.
    pub async fn publish(&self, event: &LifecycleEvent) -> usize {
        let kind = event.kind();
        let Some(subscribers) = self.subscribers.get(&kind) else {
            debug!(?kind, run_id = %event.run_id, "no subscribers");
            return 0;
        };

        let mut failures = 0;
        for subscriber in subscribers {
            if let Err(err) = subscriber.notify(event).await {
                failures += 1;
                warn!(
                    ?kind,
                    run_id = %event.run_id,
                    error = %format!("{err:#}"),
                    "subscriber failed"
                );
            }
        }
        failures
    }
}

/// Reports plan and apply transitions to the coordinator.
pub struct CoordinatorNotifier {
    coordinator: Arc<dyn Coordinator>,
}

impl CoordinatorNotifier {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Status string the coordinator expects for a transition.
    pub fn status_for(transition: Transition) -> &'static str {
        match transition {
            Transition::Started => "started",
            Transition::Completed => "finished",
            Transition::Failed => "errored",
        }
    }
}

#[async_trait]
impl Subscriber for CoordinatorNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<()> {
        let status = Self::status_for(event.transition);
        match event.operation {
            Operation::Plan => {
                self.coordinator
                    .update_plan_status(&event.subject_id, status)
                    .await
            }
            Operation::Apply => {
                self.coordinator
                    .update_apply_status(&event.subject_id, status)
                    .await
            }
        }
    }
}
