//! Typed lifecycle event bus.
//!
//! Orchestrators emit events; consumers (status rendering, notification
//! transports) subscribe. Emission never blocks and never fails: with no
//! subscribers the event is simply dropped. Consumers must tolerate
//! interleaved events from different task ids — ordering is only
//! guaranteed per task, not across workers.

use tokio::sync::broadcast;

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    TaskStart {
        task_id: String,
    },
    ProviderStart {
        task_id: String,
        provider: String,
        model: String,
    },
    ProviderComplete {
        task_id: String,
        success: bool,
        duration: f64,
    },
    ValidationStart {
        task_id: String,
    },
    ValidationComplete {
        task_id: String,
        passed: bool,
    },
    JudgeStart {
        task_id: String,
    },
    JudgeComplete {
        task_id: String,
        passed: bool,
        overall_score: f64,
    },
    TaskComplete {
        task_id: String,
        duration: f64,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
    WorkerDispatch {
        worker_id: usize,
        task_id: String,
    },
    MergeFinished {
        task_id: String,
        success: bool,
        conflict: bool,
    },
    PlannerTasksAdded {
        count: usize,
    },
    SpecSatisfied,
}

/// Broadcast-backed bus with fire-and-forget emission.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(OrchestratorEvent::TaskStart {
            task_id: "t1".to_string(),
        });
        bus.emit(OrchestratorEvent::TaskComplete {
            task_id: "t1".to_string(),
            duration: 1.5,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::TaskStart {
                task_id: "t1".to_string()
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::TaskComplete { .. }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(OrchestratorEvent::SpecSatisfied);
    }

    #[tokio::test]
    async fn dropped_receiver_unsubscribes() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(OrchestratorEvent::SpecSatisfied);

        // A fresh subscriber only sees events emitted after it joined.
        let mut rx = bus.subscribe();
        bus.emit(OrchestratorEvent::PlannerTasksAdded { count: 2 });
        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::PlannerTasksAdded { count: 2 }
        );
    }
}
