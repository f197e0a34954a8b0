//! Broadcast bus for run lifecycle events.
//!
//! Built on `tokio::sync::broadcast`: multiple concurrent subscribers, and
//! publishing with no subscribers is a no-op. Delivery is at-least-once for
//! live subscribers (a slow subscriber can observe a lag error); events from
//! distinct runs carry no ordering guarantee relative to each other.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One lifecycle event of a workflow run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        workflow_id: Uuid,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        workflow_id: Uuid,
    },
}

/// Multi-consumer bus for [`ExecutionEvent`].
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(ExecutionEvent::ExecutionStarted {
            execution_id: id,
            workflow_id: Uuid::new_v4(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ExecutionEvent::ExecutionStarted { execution_id, .. } => {
                    assert_eq!(execution_id, id)
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(ExecutionEvent::ExecutionCancelled {
            execution_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
        });
    }
}
