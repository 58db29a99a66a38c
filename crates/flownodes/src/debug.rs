use async_trait::async_trait;
use flowcore::{NodeContext, NodeError, NodeExecutable, NodeOutput};
use serde_json::{Map, Value};

/// Logs a message and its inputs, then passes the inputs through unchanged
/// so it can be dropped between any two nodes.
pub struct DebugNode;

#[async_trait]
impl NodeExecutable for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .parameters
            .get("message")
            .or_else(|| ctx.inputs.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        ctx.log.info(format!("DEBUG: {}", message));

        match &ctx.inputs {
            Value::Object(fields) => {
                for (key, value) in fields {
                    ctx.log.info(format!("  {}: {}", key, value));
                }
            }
            Value::Null => {}
            other => ctx.log.info(format!("  input: {}", other)),
        }

        Ok(NodeOutput::success(ctx.inputs))
    }

    fn validate_config(&self, parameters: &Map<String, Value>) -> Result<(), NodeError> {
        match parameters.get("message") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err(NodeError::InvalidParameters(
                "message must be a string".to_string(),
            )),
        }
    }

    fn description(&self) -> &str {
        "Logs input values for debugging"
    }

    fn category(&self) -> &str {
        "debug"
    }
}
