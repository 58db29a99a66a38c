use crate::{Edge, ExecutionError, ExecutionId, NodeExecutionState, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Started,
    Completed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Progress,
        EventKind::Started,
        EventKind::Completed,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Error => "error",
        }
    }
}

/// Events emitted during execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionEvent {
    Progress(ProgressEvent),
    Started(StartedEvent),
    Completed(CompletedEvent),
    Error(ErrorEvent),
}

impl ExecutionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ExecutionEvent::Progress(_) => EventKind::Progress,
            ExecutionEvent::Started(_) => EventKind::Started,
            ExecutionEvent::Completed(_) => EventKind::Completed,
            ExecutionEvent::Error(_) => EventKind::Error,
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Progress(e) => &e.execution_id,
            ExecutionEvent::Started(e) => &e.execution_id,
            ExecutionEvent::Completed(e) => &e.execution_id,
            ExecutionEvent::Error(e) => &e.execution_id,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            ExecutionEvent::Progress(e) => &e.node_id,
            ExecutionEvent::Started(e) => &e.node_id,
            ExecutionEvent::Completed(e) => &e.node_id,
            ExecutionEvent::Error(e) => &e.node_id,
        }
    }
}

/// Live progress of a run, broadcast to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub node_id: NodeId,
    pub execution_id: ExecutionId,
    /// Weighted completion of the whole run, 0..=100.
    pub progress: u8,
    /// Completion of `node_id` itself.
    #[serde(default)]
    pub node_progress: u8,
    pub message: String,
    /// Milliseconds left, extrapolated from the weight completed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub state: NodeExecutionState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shape of the analysed graph, sent with the root's `started` event so
/// observers can lay out progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub execution_order: Vec<Vec<NodeId>>,
    pub critical_path: Vec<NodeId>,
    pub total_weight: u64,
    pub max_parallelism: usize,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedEvent {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_type: String,
    pub timestamp: DateTime<Utc>,
    /// Only on the run's root node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub success: bool,
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub error: ExecutionError,
}

/// Process-wide event bus that per-run emitters forward into.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // No receivers is not an error; events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> broadcast::Sender<ExecutionEvent> {
        self.sender.clone()
    }
}
