//! Engine events.

use crate::result::{ApplyPhase, BatchStatus, RollbackStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Lifecycle notifications. Subscribe with
/// [`EditEngine::subscribe`](crate::EditEngine::subscribe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BatchStarted {
        batch_id: String,
        edit_sets: usize,
    },
    PhaseChanged {
        batch_id: String,
        phase: ApplyPhase,
    },
    FileWritten {
        batch_id: String,
        path: PathBuf,
    },
    FileFailed {
        batch_id: String,
        path: PathBuf,
        error: String,
    },
    BatchFinished {
        batch_id: String,
        status: BatchStatus,
        session_id: Option<String>,
    },
    SessionCreated {
        session_id: String,
        files: usize,
    },
    SessionRolledBack {
        session_id: String,
        status: RollbackStatus,
    },
    SessionExpired {
        session_id: String,
    },
}

/// Broadcast fan-out of [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish without blocking. Having no subscriber is fine.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::SessionExpired {
            session_id: "s".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::BatchStarted {
            batch_id: "b".to_string(),
            edit_sets: 2,
        });
        bus.publish(EngineEvent::PhaseChanged {
            batch_id: "b".to_string(),
            phase: ApplyPhase::Previewing,
        });
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::BatchStarted { edit_sets: 2, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::PhaseChanged {
                phase: ApplyPhase::Previewing,
                ..
            }
        ));
    }
}
