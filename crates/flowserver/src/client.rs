//! Caller-side API for executing nodes over a transport.

use crate::engine::EXECUTE_NODE;
use crate::transport::{Transport, TransportError};
use flowcore::{ErrorCode, ExecutionContext, ExecutionError, ExecutionResult, NodeDefinition};
use flowruntime::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ATTEMPTS: u32 = 3;

/// A node together with the context it should run under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub node: NodeDefinition,
    #[serde(default)]
    pub context: ExecutionContext,
}

/// Accepts either `{node, context?}` or a bare node definition, fills in
/// context defaults and checks the fields every node needs.
pub fn normalize_request(input: Value) -> Result<ExecutionRequest, ExecutionError> {
    let (node, context) = match input {
        Value::Object(mut fields) if fields.contains_key("node") => {
            let node = fields.remove("node").unwrap_or(Value::Null);
            let context = fields.remove("context").unwrap_or(Value::Null);
            (node, context)
        }
        Value::Object(fields) => (Value::Object(fields), Value::Null),
        other => {
            return Err(ExecutionError::new(
                ErrorCode::ValidationFailed,
                "Execution request must be an object",
            )
            .with_context("received", other))
        }
    };

    for field in ["id", "type"] {
        let present = node
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|value| !value.trim().is_empty());
        if !present {
            return Err(ExecutionError::new(
                ErrorCode::ValidationFailed,
                format!("Node is missing required field '{}'", field),
            )
            .with_context("field", field));
        }
    }

    let node: NodeDefinition = serde_json::from_value(node).map_err(|e| {
        ExecutionError::new(ErrorCode::ValidationFailed, format!("Invalid node definition: {}", e))
    })?;
    let context: ExecutionContext = match context {
        Value::Null => ExecutionContext::new(),
        other => serde_json::from_value(other).map_err(|e| {
            ExecutionError::new(ErrorCode::ValidationFailed, format!("Invalid context: {}", e))
                .with_node(&node.id)
        })?,
    };

    Ok(ExecutionRequest { node, context })
}

/// Executes nodes through a [`Transport`], retrying transport failures and
/// folding every failure into the returned [`ExecutionResult`].
pub struct NodeExecutionClient {
    transport: Option<Arc<dyn Transport>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl NodeExecutionClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::disconnected()
        }
    }

    /// A client with no transport; every call fails with `NO_TRANSPORT`.
    pub fn disconnected() -> Self {
        Self {
            transport: None,
            max_attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::new(Duration::from_millis(1000), Duration::from_millis(2000)),
        }
    }

    pub fn with_retries(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub async fn execute_node(&self, node: &NodeDefinition, context: ExecutionContext) -> ExecutionResult {
        self.execute(json!({ "node": node, "context": context })).await
    }

    pub async fn execute(&self, input: Value) -> ExecutionResult {
        let request = match normalize_request(input) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!("Rejected execution request: {}", error);
                return ExecutionResult::failure(error);
            }
        };
        let node_id = request.node.id.clone();
        let execution_id = request.context.execution_id.clone();

        let Some(transport) = &self.transport else {
            return ExecutionResult::failure(
                ExecutionError::new(ErrorCode::NoTransport, "No transport is configured")
                    .with_node(node_id)
                    .with_execution(execution_id),
            );
        };

        let args = match serde_json::to_value(&request) {
            Ok(args) => args,
            Err(e) => {
                return ExecutionResult::failure(
                    ExecutionError::new(ErrorCode::ValidationFailed, e.to_string()).with_node(node_id),
                )
            }
        };

        match self.call_with_retries(transport.as_ref(), EXECUTE_NODE, args).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                ExecutionResult::failure(
                    ExecutionError::new(
                        ErrorCode::IpcCommunicationFailed,
                        format!("Malformed execution result: {}", e),
                    )
                    .with_node(node_id)
                    .with_execution(execution_id),
                )
            }),
            Err((err, attempts)) => ExecutionResult::failure(
                ExecutionError::new(
                    ErrorCode::IpcCommunicationFailed,
                    format!("Failed to execute node after {} attempt(s)", attempts),
                )
                .with_cause(err.to_string())
                .with_node(node_id)
                .with_execution(execution_id)
                .with_context("attempts", attempts),
            ),
        }
    }

    async fn call_with_retries(
        &self,
        transport: &dyn Transport,
        method: &str,
        args: Value,
    ) -> Result<Value, (TransportError, u32)> {
        let mut attempt = 0;
        loop {
            match transport.call(method, args.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt + 1 >= self.max_attempts => {
                    return Err((err, attempt + 1))
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {}ms",
                        method,
                        attempt + 1,
                        self.max_attempts,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
