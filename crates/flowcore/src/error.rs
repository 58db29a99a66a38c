use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by node executables.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::MissingInput(_) => ErrorCode::ValidationFailed,
            NodeError::InvalidInputType { .. } => ErrorCode::TypeMismatch,
            NodeError::InvalidParameters(_) => ErrorCode::InvalidParameters,
            NodeError::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            NodeError::RateLimited(_) => ErrorCode::RateLimitExceeded,
            NodeError::Timeout { .. } => ErrorCode::Timeout,
            NodeError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Structural problems found while analysing a node graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Cycle detected among nodes: {}", remaining.join(", "))]
    CycleDetected { remaining: Vec<String> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
}

impl GraphError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GraphError::CycleDetected { .. } => ErrorCode::CircularDependency,
            GraphError::NodeNotFound(_) | GraphError::DuplicateNode(_) => ErrorCode::InvalidNode,
        }
    }
}

/// Canonical error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidNode,
    NodeTypeNotFound,
    NoExecutorFactory,
    ExecutionFailed,
    Timeout,
    RateLimitExceeded,
    ValidationFailed,
    InvalidParameters,
    TypeMismatch,
    CircularDependency,
    Cancelled,
    TransportError,
    IpcCommunicationFailed,
    NoTransport,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidNode => "INVALID_NODE",
            ErrorCode::NodeTypeNotFound => "NODE_TYPE_NOT_FOUND",
            ErrorCode::NoExecutorFactory => "NO_EXECUTOR_FACTORY",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::IpcCommunicationFailed => "IPC_COMMUNICATION_FAILED",
            ErrorCode::NoTransport => "NO_TRANSPORT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Recovery table consulted by callers deciding whether to re-run.
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorCode::Timeout => RecoveryStrategy::retry(
                2000,
                3,
                &[
                    "Increase the node timeout",
                    "Check that the node's upstream service is responsive",
                ],
            ),
            ErrorCode::RateLimitExceeded => RecoveryStrategy::retry(
                5000,
                5,
                &[
                    "Wait before retrying",
                    "Lower the concurrency of parallel nodes",
                ],
            ),
            ErrorCode::TransportError | ErrorCode::IpcCommunicationFailed => {
                RecoveryStrategy::retry(
                    1000,
                    3,
                    &[
                        "Check that the execution server is running",
                        "Verify the channel name and address",
                    ],
                )
            }
            ErrorCode::Cancelled => {
                RecoveryStrategy::retry(0, 1, &["Run the execution again"])
            }
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidParameters
            | ErrorCode::TypeMismatch => RecoveryStrategy::fail(&[
                "Check the node parameters against its expected configuration",
                "Make sure every required input is connected",
            ]),
            ErrorCode::CircularDependency => RecoveryStrategy::fail(&[
                "Remove one of the edges that closes the cycle",
                "Split the loop into separate executions",
            ]),
            ErrorCode::NodeTypeNotFound => RecoveryStrategy::fail(&[
                "Register an executable for this node type",
                "Check the node type for typos",
            ]),
            ErrorCode::NoExecutorFactory => {
                RecoveryStrategy::fail(&["Construct the executor with a node registry"])
            }
            ErrorCode::NoTransport => {
                RecoveryStrategy::fail(&["Connect a transport before executing nodes"])
            }
            ErrorCode::InvalidNode => {
                RecoveryStrategy::fail(&["Check node ids and edge endpoints"])
            }
            ErrorCode::ExecutionFailed | ErrorCode::UnknownError => {
                RecoveryStrategy::fail(&["Inspect the execution trace for the failing node"])
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.recovery_strategy().retryable
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStrategy {
    pub retryable: bool,
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub suggestions: Vec<String>,
}

impl RecoveryStrategy {
    fn retry(delay_ms: u64, max_attempts: u32, suggestions: &[&str]) -> Self {
        Self {
            retryable: true,
            delay_ms,
            max_attempts,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn fail(suggestions: &[&str]) -> Self {
        Self {
            retryable: false,
            delay_ms: 0,
            max_attempts: 1,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Canonical error shape returned in `ExecutionResult.error`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            execution_id: None,
            timestamp: Utc::now(),
            stack: None,
            cause: None,
            context: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn recovery(&self) -> RecoveryStrategy {
        self.code.recovery_strategy()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<NodeError> for ExecutionError {
    fn from(err: NodeError) -> Self {
        // Debug form keeps the variant name, which is the closest thing to a stack we have.
        ExecutionError::new(err.code(), err.to_string()).with_stack(format!("{:?}", err))
    }
}

impl From<GraphError> for ExecutionError {
    fn from(err: GraphError) -> Self {
        let error = ExecutionError::new(err.code(), err.to_string());
        match err {
            GraphError::CycleDetected { remaining } => error.with_context("remaining", remaining),
            GraphError::NodeNotFound(id) | GraphError::DuplicateNode(id) => error.with_node(id),
        }
    }
}
