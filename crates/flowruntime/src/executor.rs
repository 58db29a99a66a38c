use crate::graph::{analyze_execution_graph, topological_sort};
use crate::registry::NodeRegistry;
use crate::retry::{execute_with_retries, Backoff};
use crate::state::{ExecutionStateStore, StateError};
use chrono::Utc;
use flowcore::{
    CompletedEvent, Edge, ErrorCode, ErrorEvent, EventEmitter, ExecutionContext, ExecutionError,
    ExecutionEvent, ExecutionResult, ExecutionTrace, GraphSummary, NodeContext, NodeDefinition,
    NodeExecutionState, NodeId, NodeLog, ProgressEvent, StartedEvent, WeightTable,
};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// A progress step shown before a node runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub progress: u8,
    pub message: String,
    pub delay: Duration,
}

/// Presentation hook: what progress to narrate before each node executes.
/// Scheduling never depends on it.
pub trait ProgressNarrator: Send + Sync {
    fn checkpoints(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Vec<Checkpoint>;
}

pub struct SilentNarrator;

impl ProgressNarrator for SilentNarrator {
    fn checkpoints(&self, _node: &NodeDefinition, _ctx: &ExecutionContext) -> Vec<Checkpoint> {
        Vec::new()
    }
}

/// Spreads the context's `slow_mo` over fixed checkpoints so observers can
/// watch progress move. Silent when `slow_mo` is zero.
pub struct SlowMoNarrator;

const SLOW_MO_STEPS: &[(u8, &str)] = &[
    (0, "Initializing"),
    (20, "Preparing inputs"),
    (40, "Validating configuration"),
    (60, "Executing"),
    (80, "Processing results"),
    (90, "Finalizing"),
];

impl ProgressNarrator for SlowMoNarrator {
    fn checkpoints(&self, _node: &NodeDefinition, ctx: &ExecutionContext) -> Vec<Checkpoint> {
        if ctx.slow_mo == 0 {
            return Vec::new();
        }
        let delay = Duration::from_millis(ctx.slow_mo / SLOW_MO_STEPS.len() as u64);
        SLOW_MO_STEPS
            .iter()
            .map(|(progress, message)| Checkpoint {
                progress: *progress,
                message: message.to_string(),
                delay,
            })
            .collect()
    }
}

/// Result of a run together with the final state of its store.
#[derive(Debug)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    pub state: ExecutionStateStore,
}

/// Runs node graphs. Composite children run one at a time in topological
/// order; the first failure aborts the remaining siblings.
pub struct Executor {
    registry: Option<Arc<NodeRegistry>>,
    weights: Arc<WeightTable>,
    max_retries: u32,
    node_timeout: Duration,
    backoff: Backoff,
    narrator: Arc<dyn ProgressNarrator>,
}

impl Executor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::without_registry()
        }
    }

    /// An executor that cannot resolve any node type.
    pub fn without_registry() -> Self {
        Self {
            registry: None,
            weights: Arc::new(WeightTable::default()),
            max_retries: DEFAULT_MAX_RETRIES,
            node_timeout: DEFAULT_NODE_TIMEOUT,
            backoff: Backoff::default(),
            narrator: Arc::new(SilentNarrator),
        }
    }

    pub fn with_weights(mut self, weights: Arc<WeightTable>) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, node_timeout: Duration) -> Self {
        self.max_retries = max_retries;
        self.node_timeout = node_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn ProgressNarrator>) -> Self {
        self.narrator = narrator;
        self
    }

    pub async fn execute(
        &self,
        node: &NodeDefinition,
        context: ExecutionContext,
        emitter: &EventEmitter,
    ) -> ExecutionResult {
        self.execute_with_state(node, context, emitter).await.result
    }

    pub async fn execute_with_state(
        &self,
        node: &NodeDefinition,
        context: ExecutionContext,
        emitter: &EventEmitter,
    ) -> ExecutionReport {
        let started = Instant::now();
        let execution_id = context.execution_id.clone();
        tracing::info!(execution_id = %execution_id, node_id = %node.id, "Starting execution");

        let mut run = Run::new(execution_id.clone(), emitter.clone());

        let graph = match analyze_execution_graph(node, &self.weights) {
            Ok(graph) => graph,
            Err(err) => {
                let error = ExecutionError::from(err).with_execution(&execution_id);
                tracing::error!(execution_id = %execution_id, "Graph analysis failed: {}", error);
                run.trace.record_completed(false);
                run.store.complete_execution();
                let result = ExecutionResult::failure(error)
                    .with_duration(started.elapsed().as_millis() as u64)
                    .with_executed_nodes(Vec::new())
                    .with_trace(run.trace);
                return ExecutionReport {
                    result,
                    state: run.store,
                };
            }
        };
        run.store.initialize_graph(&graph);
        run.graph = Some(graph.summary());

        let cancellation = context.cancellation.clone();
        let outcome = self.execute_node(&mut run, node, context).await;

        if cancellation.is_cancelled() {
            let cancelled = run.store.cancel_pending();
            if !cancelled.is_empty() {
                tracing::info!(execution_id = %execution_id, "Cancelled {} pending nodes", cancelled.len());
            }
        }
        run.store.complete_execution();
        run.trace.record_completed(outcome.output.is_ok());
        run.emitter.flush();

        let duration = started.elapsed().as_millis() as u64;
        let result = match outcome.output {
            Ok(data) => {
                tracing::info!(execution_id = %execution_id, "Execution completed in {}ms", duration);
                ExecutionResult::success(data)
            }
            Err(error) => {
                tracing::error!(execution_id = %execution_id, "Execution failed after {}ms: {}", duration, error);
                ExecutionResult::failure(error)
            }
        };

        ExecutionReport {
            result: result
                .with_duration(duration)
                .with_executed_nodes(outcome.executed)
                .with_trace(run.trace),
            state: run.store,
        }
    }

    fn execute_node<'a>(
        &'a self,
        run: &'a mut Run,
        node: &'a NodeDefinition,
        ctx: ExecutionContext,
    ) -> BoxFuture<'a, NodeRun> {
        Box::pin(async move {
            if node.is_composite() {
                self.execute_composite(run, node, ctx).await
            } else {
                self.execute_atomic(run, node, ctx).await
            }
        })
    }

    async fn execute_atomic(
        &self,
        run: &mut Run,
        node: &NodeDefinition,
        ctx: ExecutionContext,
    ) -> NodeRun {
        tracing::debug!(execution_id = %ctx.execution_id, node_id = %node.id, "Executing node ({})", node.node_type);
        let started = Instant::now();
        run.transition(node, NodeExecutionState::Executing, None);
        run.emit_started(node);

        let outcome = self.run_executable(run, node, &ctx).await;
        let duration = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                run.transition(node, NodeExecutionState::Completed, None);
                run.progress(&node.id, 100, "Completed");
                run.emit_completed(node, true, duration);
                NodeRun {
                    output: Ok(output),
                    executed: vec![node.id.clone()],
                }
            }
            Err(error) => {
                let error = error.with_node(&node.id).with_execution(&ctx.execution_id);
                tracing::error!(execution_id = %ctx.execution_id, node_id = %node.id, "Node failed: {}", error);
                run.fail(node, &error, duration);
                NodeRun {
                    output: Err(error),
                    executed: vec![node.id.clone()],
                }
            }
        }
    }

    async fn run_executable(
        &self,
        run: &mut Run,
        node: &NodeDefinition,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            ExecutionError::new(
                ErrorCode::NoExecutorFactory,
                "No node registry was supplied to the executor",
            )
        })?;
        let executable = registry.get(&node.node_type).ok_or_else(|| {
            ExecutionError::new(
                ErrorCode::NodeTypeNotFound,
                format!("Unknown node type: {}", node.node_type),
            )
            .with_context("type", node.node_type.clone())
        })?;
        executable.validate_config(&node.parameters)?;

        for checkpoint in self.narrator.checkpoints(node, ctx) {
            tokio::select! {
                _ = tokio::time::sleep(checkpoint.delay) => {}
                _ = ctx.cancellation.cancelled() => break,
            }
            run.progress(&node.id, checkpoint.progress, &checkpoint.message);
        }

        let node_ctx = NodeContext {
            node_id: node.id.clone(),
            execution_id: ctx.execution_id.clone(),
            inputs: ctx.inputs.clone(),
            parameters: node.parameters.clone(),
            variables: ctx.variables.clone(),
            log: NodeLog::new(ctx.execution_id.clone(), node.id.clone()),
            cancellation: ctx.cancellation.clone(),
        };
        let (max_retries, timeout) = node
            .retry
            .map(|policy| (policy.max_retries, Duration::from_millis(policy.timeout_ms)))
            .unwrap_or((self.max_retries, self.node_timeout));

        let output =
            execute_with_retries(executable.as_ref(), &node_ctx, max_retries, timeout, self.backoff)
                .await?;

        if output.success {
            Ok(output.outputs)
        } else {
            let message = output
                .error
                .unwrap_or_else(|| "Node reported failure".to_string());
            Err(ExecutionError::new(ErrorCode::ExecutionFailed, message))
        }
    }

    async fn execute_composite(
        &self,
        run: &mut Run,
        node: &NodeDefinition,
        ctx: ExecutionContext,
    ) -> NodeRun {
        let started = Instant::now();
        let order: Vec<NodeId> = match topological_sort(&node.nodes, &node.edges) {
            Ok(levels) => levels.into_iter().flatten().collect(),
            Err(err) => {
                let error = ExecutionError::from(err)
                    .with_node(&node.id)
                    .with_execution(&ctx.execution_id);
                run.transition(node, NodeExecutionState::Executing, None);
                run.fail(node, &error, 0);
                return NodeRun {
                    output: Err(error),
                    executed: Vec::new(),
                };
            }
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            node_id = %node.id,
            "Executing composite with {} children",
            order.len()
        );
        run.transition(node, NodeExecutionState::Executing, None);
        run.emit_started(node);

        let mut outputs: HashMap<NodeId, Value> = HashMap::new();
        let mut executed = Vec::with_capacity(order.len());
        let mut last = Value::Null;

        for child_id in order {
            if ctx.is_cancelled() {
                let error = ExecutionError::new(ErrorCode::Cancelled, "Execution was cancelled")
                    .with_node(&node.id)
                    .with_execution(&ctx.execution_id)
                    .with_context("nextNode", child_id);
                run.fail(node, &error, started.elapsed().as_millis() as u64);
                return NodeRun {
                    output: Err(error),
                    executed,
                };
            }

            let Some(child) = node.find_node(&child_id) else {
                continue;
            };
            let input = resolve_inputs(&child_id, &node.edges, &outputs, &ctx.inputs);
            let child_run = self.execute_node(run, child, ctx.child(input)).await;
            executed.push(child_id.clone());

            match child_run.output {
                Ok(value) => {
                    last = value.clone();
                    outputs.insert(child_id, value);
                }
                Err(error) => {
                    tracing::warn!(
                        execution_id = %ctx.execution_id,
                        node_id = %node.id,
                        "Child {} failed, skipping remaining siblings",
                        child_id
                    );
                    run.fail(node, &error, started.elapsed().as_millis() as u64);
                    return NodeRun {
                        output: Err(error),
                        executed,
                    };
                }
            }
        }

        run.transition(node, NodeExecutionState::Completed, None);
        run.emit_completed(node, true, started.elapsed().as_millis() as u64);
        NodeRun {
            output: Ok(last),
            executed,
        }
    }
}

/// Build a node's input from the outputs of its upstream siblings.
///
/// No resolved edge: the parent's input. One resolved edge without a target
/// handle: that upstream output. Otherwise an object keyed by target handle,
/// or by source id when the edge has none. A source handle selects that key
/// from an object output.
pub fn resolve_inputs(
    target: &str,
    edges: &[Edge],
    outputs: &HashMap<NodeId, Value>,
    fallback: &Value,
) -> Value {
    let resolved: Vec<(&Edge, Value)> = edges
        .iter()
        .filter(|edge| edge.target == target)
        .filter_map(|edge| {
            outputs
                .get(&edge.source)
                .map(|output| (edge, select_port(output, edge.source_handle.as_deref())))
        })
        .collect();

    match resolved.as_slice() {
        [] => fallback.clone(),
        [(edge, value)] if edge.target_handle.is_none() => value.clone(),
        _ => {
            let mut inputs = Map::new();
            for (edge, value) in &resolved {
                let key = edge
                    .target_handle
                    .clone()
                    .unwrap_or_else(|| edge.source.clone());
                inputs.insert(key, value.clone());
            }
            Value::Object(inputs)
        }
    }
}

fn select_port(output: &Value, handle: Option<&str>) -> Value {
    match handle.and_then(|handle| output.get(handle)) {
        Some(value) => value.clone(),
        None => output.clone(),
    }
}

struct NodeRun {
    output: Result<Value, ExecutionError>,
    executed: Vec<NodeId>,
}

/// Mutable bookkeeping for one run: store, trace and event fan-out.
struct Run {
    execution_id: String,
    store: ExecutionStateStore,
    trace: ExecutionTrace,
    emitter: EventEmitter,
    graph: Option<GraphSummary>,
}

impl Run {
    fn new(execution_id: String, emitter: EventEmitter) -> Self {
        Self {
            trace: ExecutionTrace::new(execution_id.clone()),
            execution_id,
            store: ExecutionStateStore::new(),
            emitter,
            graph: None,
        }
    }

    fn transition(&mut self, node: &NodeDefinition, state: NodeExecutionState, error: Option<&str>) {
        match self.store.set_node_state(&node.id, state, error) {
            Ok(()) => {}
            // Nested children and the root composite are traced but not tracked.
            Err(StateError::UnknownNode(_)) => {}
            Err(err) => tracing::warn!(execution_id = %self.execution_id, "{}", err),
        }
        self.trace.record_state(&node.id, &node.node_type, state, error);
    }

    fn progress(&mut self, node_id: &str, percent: u8, message: &str) {
        let _ = self.store.set_node_progress(node_id, percent, Some(message));
        self.trace.record_progress(node_id, percent, Some(message));
        self.publish(node_id, percent, message);
    }

    /// Push the store's current view: run-level progress, ETA and every
    /// tracked node's state.
    fn publish(&self, node_id: &str, node_progress: u8, message: &str) {
        self.emitter.emit_progress(ProgressEvent {
            node_id: node_id.to_string(),
            execution_id: self.execution_id.clone(),
            progress: self.store.get_execution_progress(),
            node_progress,
            message: message.to_string(),
            estimated_time_remaining: self
                .store
                .get_estimated_time_remaining()
                .map(|eta| eta.as_millis() as u64),
            nodes: self.store.snapshot(),
        });
    }

    fn fail(&mut self, node: &NodeDefinition, error: &ExecutionError, duration: u64) {
        let state = if error.code == ErrorCode::Cancelled {
            // Nothing further will be scheduled in this run.
            self.store.cancel_pending();
            NodeExecutionState::Cancelled
        } else {
            NodeExecutionState::Error
        };
        self.transition(node, state, Some(&error.message));
        let node_progress = self.store.node(&node.id).map_or(0, |n| n.progress);
        // Error and completed events flush this first, so observers see the
        // failed snapshot before the terminal events.
        self.publish(&node.id, node_progress, &error.message);
        self.emitter.emit(ExecutionEvent::Error(ErrorEvent {
            execution_id: self.execution_id.clone(),
            node_id: node.id.clone(),
            error: error.clone(),
        }));
        self.emit_completed(node, false, duration);
    }

    /// The first node started is the root; it carries the graph summary.
    fn emit_started(&mut self, node: &NodeDefinition) {
        self.emitter.emit(ExecutionEvent::Started(StartedEvent {
            execution_id: self.execution_id.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            timestamp: Utc::now(),
            graph: self.graph.take(),
        }));
    }

    fn emit_completed(&self, node: &NodeDefinition, success: bool, duration: u64) {
        self.emitter.emit(ExecutionEvent::Completed(CompletedEvent {
            execution_id: self.execution_id.clone(),
            node_id: node.id.clone(),
            success,
            duration,
            timestamp: Utc::now(),
        }));
    }
}
