//! Mutable per-run state: node lifecycle, live progress and the aggregates
//! derived from them. One store per run, written only by that run's executor.

use crate::graph::ExecutionGraph;
use chrono::{DateTime, Utc};
use flowcore::{NodeExecutionState, NodeId, NodeSnapshot};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Node {0} is not part of the current graph")]
    UnknownNode(NodeId),

    #[error("Invalid transition for node {node_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeExecutionState,
        to: NodeExecutionState,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRuntimeState {
    pub node_type: String,
    pub weight: u64,
    pub state: NodeExecutionState,
    pub progress: u8,
    pub message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionStateStore {
    nodes: HashMap<NodeId, NodeRuntimeState>,
    order: Vec<NodeId>,
    total_weight: u64,
    is_executing: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl ExecutionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed every node at `pending` and mark the run as executing.
    pub fn initialize_graph(&mut self, graph: &ExecutionGraph) {
        self.reset();
        for id in graph.ordered_ids() {
            let Some(node) = graph.node(id) else { continue };
            self.nodes.insert(
                id.clone(),
                NodeRuntimeState {
                    node_type: node.node_type.clone(),
                    weight: node.weight,
                    state: NodeExecutionState::Pending,
                    progress: 0,
                    message: None,
                    start_time: None,
                    end_time: None,
                    duration_ms: None,
                    error: None,
                },
            );
            self.order.push(id.clone());
        }
        self.total_weight = graph.total_weight();
        self.is_executing = true;
        self.start_time = Some(Utc::now());
    }

    pub fn set_node_state(
        &mut self,
        node_id: &str,
        state: NodeExecutionState,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StateError::UnknownNode(node_id.to_string()))?;

        if !node.state.can_transition_to(state) {
            return Err(StateError::InvalidTransition {
                node_id: node_id.to_string(),
                from: node.state,
                to: state,
            });
        }

        let now = Utc::now();
        node.state = state;
        match state {
            NodeExecutionState::Executing => {
                node.start_time.get_or_insert(now);
            }
            NodeExecutionState::Error => {
                node.error = error.map(str::to_string);
            }
            NodeExecutionState::Completed => {
                node.progress = 100;
            }
            _ => {}
        }
        if state.is_terminal() {
            node.end_time = Some(now);
            node.duration_ms = node
                .start_time
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
        }
        Ok(())
    }

    /// Progress may move backwards; replayed or narrated steps are allowed.
    pub fn set_node_progress(
        &mut self,
        node_id: &str,
        percent: u8,
        message: Option<&str>,
    ) -> Result<(), StateError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StateError::UnknownNode(node_id.to_string()))?;
        node.progress = percent.min(100);
        if let Some(message) = message {
            node.message = Some(message.to_string());
        }
        Ok(())
    }

    pub fn complete_execution(&mut self) {
        self.is_executing = false;
        self.end_time = Some(Utc::now());
    }

    pub fn reset(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.total_weight = 0;
        self.is_executing = false;
        self.start_time = None;
        self.end_time = None;
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRuntimeState> {
        self.nodes.get(node_id)
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn get_completed_weight(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| n.state == NodeExecutionState::Completed)
            .map(|n| n.weight)
            .sum()
    }

    /// Weighted completion percentage, 0..=100.
    pub fn get_execution_progress(&self) -> u8 {
        if self.total_weight == 0 {
            return 0;
        }
        let ratio = self.get_completed_weight() as f64 / self.total_weight as f64;
        (ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn get_nodes_by_state(&self, state: NodeExecutionState) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.nodes.get(*id).is_some_and(|n| n.state == state))
            .cloned()
            .collect()
    }

    /// Extrapolates elapsed time over the remaining weight. `None` until some
    /// weight has completed.
    pub fn get_estimated_time_remaining(&self) -> Option<Duration> {
        let completed = self.get_completed_weight();
        let start = self.start_time?;
        if completed == 0 {
            return None;
        }
        let elapsed_ms = (self.end_time.unwrap_or_else(Utc::now) - start)
            .num_milliseconds()
            .max(0) as u64;
        let remaining = self.total_weight.saturating_sub(completed);
        Some(Duration::from_millis(elapsed_ms * remaining / completed))
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.order
            .iter()
            .filter_map(|id| {
                self.nodes.get(id).map(|node| NodeSnapshot {
                    id: id.clone(),
                    node_type: node.node_type.clone(),
                    state: node.state,
                    progress: node.progress,
                    start_time: node.start_time,
                    end_time: node.end_time,
                    duration: node.duration_ms,
                    error: node.error.clone(),
                })
            })
            .collect()
    }

    /// Mark every node that never started as cancelled.
    pub fn cancel_pending(&mut self) -> Vec<NodeId> {
        let pending = self.get_nodes_by_state(NodeExecutionState::Pending);
        for id in &pending {
            if let Some(node) = self.nodes.get_mut(id) {
                node.state = NodeExecutionState::Cancelled;
                node.end_time = Some(Utc::now());
            }
        }
        pending
    }
}
