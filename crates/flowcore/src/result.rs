use crate::{ExecutionError, ExecutionId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionState {
    Pending,
    Executing,
    Completed,
    Error,
    Cancelled,
}

impl NodeExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeExecutionState::Completed | NodeExecutionState::Error | NodeExecutionState::Cancelled
        )
    }

    /// Transitions only move forward; nothing re-enters a state it left.
    pub fn can_transition_to(&self, next: NodeExecutionState) -> bool {
        use NodeExecutionState::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Cancelled)
                | (Executing, Completed)
                | (Executing, Error)
                | (Executing, Cancelled)
        )
    }
}

/// Outcome of executing a node or graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_nodes: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<ExecutionTrace>,
}

impl ExecutionResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration: None,
            executed_nodes: None,
            trace: None,
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            duration: None,
            executed_nodes: None,
            trace: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = Some(duration_ms);
        self
    }

    pub fn with_executed_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.executed_nodes = Some(nodes);
        self
    }

    pub fn with_trace(mut self, trace: ExecutionTrace) -> Self {
        self.trace = Some(trace);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceEventKind {
    Started,
    StateChange,
    Progress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPoint {
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrace {
    pub node_type: String,
    pub state: NodeExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress_events: Vec<ProgressPoint>,
}

/// Append-only diagnostic log of a run. Not meant for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
    pub events: Vec<TraceEvent>,
    pub nodes: BTreeMap<NodeId, NodeTrace>,
}

impl ExecutionTrace {
    pub fn new(execution_id: impl Into<ExecutionId>) -> Self {
        let started_at = Utc::now();
        Self {
            execution_id: execution_id.into(),
            started_at,
            events: vec![TraceEvent {
                kind: TraceEventKind::Started,
                node_id: None,
                timestamp: started_at,
                state: None,
                progress: None,
                message: None,
            }],
            nodes: BTreeMap::new(),
        }
    }

    pub fn record_state(
        &mut self,
        node_id: &str,
        node_type: &str,
        state: NodeExecutionState,
        error: Option<&str>,
    ) {
        let now = Utc::now();
        self.events.push(TraceEvent {
            kind: TraceEventKind::StateChange,
            node_id: Some(node_id.to_string()),
            timestamp: now,
            state: Some(state),
            progress: None,
            message: error.map(str::to_string),
        });

        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeTrace {
                node_type: node_type.to_string(),
                state: NodeExecutionState::Pending,
                start_time: None,
                end_time: None,
                duration: None,
                error: None,
                progress_events: Vec::new(),
            });
        node.state = state;
        if state == NodeExecutionState::Executing && node.start_time.is_none() {
            node.start_time = Some(now);
        }
        if state.is_terminal() {
            node.end_time = Some(now);
            node.duration = node
                .start_time
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
        }
        if let Some(error) = error {
            node.error = Some(error.to_string());
        }
    }

    pub fn record_progress(&mut self, node_id: &str, progress: u8, message: Option<&str>) {
        let now = Utc::now();
        self.events.push(TraceEvent {
            kind: TraceEventKind::Progress,
            node_id: Some(node_id.to_string()),
            timestamp: now,
            state: None,
            progress: Some(progress),
            message: message.map(str::to_string),
        });
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.progress_events.push(ProgressPoint {
                progress,
                message: message.map(str::to_string),
                timestamp: now,
            });
        }
    }

    pub fn record_completed(&mut self, success: bool) {
        self.events.push(TraceEvent {
            kind: TraceEventKind::Completed,
            node_id: None,
            timestamp: Utc::now(),
            state: None,
            progress: None,
            message: Some(if success { "success" } else { "failure" }.to_string()),
        });
    }

    /// The first node that ended in `error`. Enclosing composites fail after
    /// their child, so this is the node that caused the failure.
    pub fn failed_node(&self) -> Option<&str> {
        self.events.iter().find_map(|event| match event.state {
            Some(NodeExecutionState::Error) => event.node_id.as_deref(),
            _ => None,
        })
    }
}
