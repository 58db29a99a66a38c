use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ExecutionId = String;

/// Per-run execution context. Children inherit everything except `inputs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default = "new_execution_id")]
    pub execution_id: ExecutionId,

    /// Input handed to the node; composites pass it to children without upstream edges.
    #[serde(default)]
    pub inputs: Value,

    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Milliseconds spread across the narrated progress checkpoints of each node.
    #[serde(default)]
    pub slow_mo: u64,

    #[serde(default)]
    pub debug: bool,

    #[serde(skip)]
    pub cancellation: CancellationToken,
}

pub fn new_execution_id() -> ExecutionId {
    Uuid::new_v4().to_string()
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            execution_id: new_execution_id(),
            inputs: Value::Null,
            variables: Map::new(),
            slow_mo: 0,
            debug: false,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<ExecutionId>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_slow_mo(mut self, slow_mo_ms: u64) -> Self {
        self.slow_mo = slow_mo_ms;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Context for a child node: same run, flags and cancellation, new input.
    pub fn child(&self, inputs: Value) -> Self {
        Self {
            execution_id: self.execution_id.clone(),
            inputs,
            variables: self.variables.clone(),
            slow_mo: self.slow_mo,
            debug: self.debug,
            cancellation: self.cancellation.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_inherits_run_flags() {
        let parent = ExecutionContext::new()
            .with_execution_id("exec-1")
            .with_variable("env", "test")
            .with_slow_mo(300)
            .with_debug(true)
            .with_inputs(json!({"a": 1}));

        let child = parent.child(json!(42));
        assert_eq!(child.execution_id, "exec-1");
        assert_eq!(child.variables["env"], json!("test"));
        assert_eq!(child.slow_mo, 300);
        assert!(child.debug);
        assert_eq!(child.inputs, json!(42));

        parent.cancellation.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_defaults_when_deserializing() {
        let ctx: ExecutionContext = serde_json::from_value(json!({})).unwrap();
        assert!(!ctx.execution_id.is_empty());
        assert_eq!(ctx.slow_mo, 0);
        assert!(!ctx.debug);
        assert!(ctx.inputs.is_null());
    }
}
