use crate::executor::{Executor, SlowMoNarrator};
use crate::graph::{analyze_execution_graph, ExecutionGraph};
use crate::registry::NodeRegistry;
use crate::retry::Backoff;
use flowcore::{
    ErrorCode, EventBus, EventEmitter, ExecutionContext, ExecutionError, ExecutionEvent,
    ExecutionId, ExecutionResult, GraphError, NodeDefinition, WeightTable,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

type ActiveRuns = Mutex<HashMap<ExecutionId, CancellationToken>>;

/// Main runtime for executing node graphs
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    weights: Arc<WeightTable>,
    config: RuntimeConfig,
    backoff: Backoff,
    event_bus: Arc<EventBus>,
    active: Arc<ActiveRuns>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            weights: Arc::new(WeightTable::default()),
            config,
            backoff: Backoff::default(),
            event_bus,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_weights(mut self, weights: WeightTable) -> Self {
        self.weights = Arc::new(weights);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get access to the node registry for registering node types
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to events from every run
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Execute a node graph. Each run gets its own graph, state store and
    /// emitter; its events are forwarded to the shared bus.
    pub async fn execute(&self, node: &NodeDefinition, context: ExecutionContext) -> ExecutionResult {
        let execution_id = context.execution_id.clone();
        let Some(_guard) = ActiveGuard::register(&self.active, &execution_id, &context.cancellation)
        else {
            let error = ExecutionError::new(
                ErrorCode::ValidationFailed,
                format!("Execution {} is already running", execution_id),
            )
            .with_execution(&execution_id);
            return ExecutionResult::failure(error);
        };

        let emitter = EventEmitter::new(self.config.progress_throttle());
        let _forwarding = emitter.forward_to(&self.event_bus);

        let executor = Executor::new(self.registry.clone())
            .with_weights(self.weights.clone())
            .with_retries(self.config.max_retries, self.config.node_timeout())
            .with_backoff(self.backoff)
            .with_narrator(Arc::new(SlowMoNarrator));

        let result = executor.execute(node, context, &emitter).await;
        emitter.flush();
        emitter.remove_all_listeners();
        result
    }

    /// Cancel a running execution. Returns false if no run has that id.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match lock(&self.active).get(execution_id) {
            Some(token) => {
                tracing::info!(execution_id = %execution_id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = lock(&self.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn analyze(&self, node: &NodeDefinition) -> Result<ExecutionGraph, GraphError> {
        analyze_execution_graph(node, &self.weights)
    }

    /// Node types referenced anywhere in the tree that the registry can't run.
    pub fn unknown_node_types(&self, node: &NodeDefinition) -> Vec<String> {
        let mut unknown = BTreeSet::new();
        collect_unknown(&self.registry, node, &mut unknown);
        unknown.into_iter().collect()
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_unknown(registry: &NodeRegistry, node: &NodeDefinition, unknown: &mut BTreeSet<String>) {
    if node.is_composite() {
        for child in &node.nodes {
            collect_unknown(registry, child, unknown);
        }
    } else if !registry.contains(&node.node_type) {
        unknown.insert(node.node_type.clone());
    }
}

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<ExecutionId, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a run's cancellation token addressable until the run ends,
/// including when the run future is dropped.
struct ActiveGuard {
    active: Arc<ActiveRuns>,
    execution_id: ExecutionId,
}

impl ActiveGuard {
    fn register(
        active: &Arc<ActiveRuns>,
        execution_id: &str,
        token: &CancellationToken,
    ) -> Option<Self> {
        let mut runs = lock(active);
        if runs.contains_key(execution_id) {
            return None;
        }
        runs.insert(execution_id.to_string(), token.clone());
        Some(Self {
            active: active.clone(),
            execution_id: execution_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.execution_id);
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub max_retries: u32,
    pub node_timeout_ms: u64,
    pub progress_throttle_ms: u64,
    pub event_buffer_size: usize,
    pub max_parallel_nodes: usize,
}

impl RuntimeConfig {
    /// Defaults overridden by `FLOW_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        read_var(&lookup, "FLOW_MAX_RETRIES", &mut config.max_retries);
        read_var(&lookup, "FLOW_NODE_TIMEOUT_MS", &mut config.node_timeout_ms);
        read_var(&lookup, "FLOW_PROGRESS_THROTTLE_MS", &mut config.progress_throttle_ms);
        read_var(&lookup, "FLOW_EVENT_BUFFER_SIZE", &mut config.event_buffer_size);
        read_var(&lookup, "FLOW_MAX_PARALLEL_NODES", &mut config.max_parallel_nodes);
        config
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
}

fn read_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw),
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            node_timeout_ms: 30_000,
            progress_throttle_ms: 100,
            event_buffer_size: 1000,
            max_parallel_nodes: 10,
        }
    }
}
