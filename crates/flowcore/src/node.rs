use crate::{ExecutionId, NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait NodeExecutable: Send + Sync {
    /// Unique type identifier (e.g., "debug.log", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Execute the node with given context.
    ///
    /// `Ok` with `success == false` is a soft failure; `Err` is a hard one.
    /// Both are retried by the executor until its attempts run out.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate parameters before the node is scheduled
    fn validate_config(&self, _parameters: &Map<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }

    fn description(&self) -> &str {
        ""
    }

    fn category(&self) -> &str {
        "general"
    }
}

/// Execution context passed to each node
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub execution_id: ExecutionId,

    /// Resolved from upstream outputs, or the parent's input
    pub inputs: Value,

    /// Static configuration for this node
    pub parameters: Map<String, Value>,

    pub variables: Map<String, Value>,

    pub log: NodeLog,

    /// Cancelled when the run is cancelled; long-running nodes should poll it
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(node_id: impl Into<NodeId>, execution_id: impl Into<ExecutionId>) -> Self {
        let node_id = node_id.into();
        let execution_id = execution_id.into();
        Self {
            log: NodeLog::new(execution_id.clone(), node_id.clone()),
            node_id,
            execution_id,
            inputs: Value::Null,
            parameters: Map::new(),
            variables: Map::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Get a named field of an object input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get parameter or return error
    pub fn require_parameter(&self, name: &str) -> Result<&Value, NodeError> {
        self.parameters
            .get(name)
            .ok_or_else(|| NodeError::InvalidParameters(format!("Missing parameter: {}", name)))
    }

    /// Get parameter with default
    pub fn parameter_or(&self, name: &str, default: Value) -> Value {
        self.parameters.get(name).cloned().unwrap_or(default)
    }
}

/// Logger handed to nodes; stamps run and node ids onto every event.
#[derive(Debug, Clone)]
pub struct NodeLog {
    execution_id: ExecutionId,
    node_id: NodeId,
}

impl NodeLog {
    pub fn new(execution_id: ExecutionId, node_id: NodeId) -> Self {
        Self {
            execution_id,
            node_id,
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!(execution_id = %self.execution_id, node_id = %self.node_id, "{}", message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!(execution_id = %self.execution_id, node_id = %self.node_id, "{}", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!(execution_id = %self.execution_id, node_id = %self.node_id, "{}", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        tracing::error!(execution_id = %self.execution_id, node_id = %self.node_id, "{}", message.as_ref());
    }
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub success: bool,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeOutput {
    pub fn success(outputs: impl Into<Value>) -> Self {
        Self {
            success: true,
            outputs: outputs.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: Value::Null,
            error: Some(error.into()),
        }
    }
}
