/// Run and node status events
///
/// The orchestrator publishes one event per run start, node status change and
/// run finish. `BroadcastPublisher` fans them out to any number of subscribers
/// (the SSE endpoint subscribes per request and filters by execution id).

use crate::error::NodeError;
use crate::workflow::types::{NodeStatus, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: String,
        workflow_id: String,
        at: DateTime<Utc>,
    },
    NodeStatusChanged {
        execution_id: String,
        node_id: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeError>,
        at: DateTime<Utc>,
    },
    RunFinished {
        execution_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeError>,
        duration_ms: Option<i64>,
        at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::NodeStatusChanged { execution_id, .. }
            | ExecutionEvent::RunFinished { execution_id, .. } => execution_id,
        }
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::RunStarted { .. } => "run_started",
            ExecutionEvent::NodeStatusChanged { .. } => "node_status_changed",
            ExecutionEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ExecutionEvent::RunFinished { .. })
    }
}

pub trait EventPublisher: Send + Sync {
    /// Must not block; slow consumers may miss events
    fn publish(&self, event: ExecutionEvent);
}

#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: ExecutionEvent) {
        tracing::trace!("📣 {} for {}", event.name(), event.execution_id());
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(ExecutionEvent::RunStarted {
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), "e1");
        assert_eq!(event.name(), "run_started");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_started");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let publisher = BroadcastPublisher::new(1);
        publisher.publish(ExecutionEvent::RunFinished {
            execution_id: "e1".into(),
            status: RunStatus::Completed,
            error: None,
            duration_ms: Some(3),
            at: Utc::now(),
        });
    }
}
