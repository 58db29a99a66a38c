use async_trait::async_trait;
use flowcore::{NodeContext, NodeError, NodeExecutable, NodeOutput};
use serde_json::{Map, Value};

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a JSON string. Reads the `json` field of an object input, or the
/// input itself when it is a bare string.
pub struct JsonParseNode;

#[async_trait]
impl NodeExecutable for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = match &ctx.inputs {
            Value::String(_) => &ctx.inputs,
            _ => ctx.require_input("json")?,
        };
        let text = input.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "json".to_string(),
            expected: "string".to_string(),
            actual: type_name(input).to_string(),
        })?;

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::success(parsed))
    }

    fn description(&self) -> &str {
        "Parse JSON string"
    }

    fn category(&self) -> &str {
        "transform"
    }
}

/// Serialize a value to a JSON string: the `value` field of an object input
/// when present, otherwise the whole input.
pub struct JsonStringifyNode;

#[async_trait]
impl NodeExecutable for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.inputs.get("value").unwrap_or(&ctx.inputs);
        let pretty = ctx
            .parameters
            .get("pretty")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::success(json_str))
    }

    fn description(&self) -> &str {
        "Convert value to JSON string"
    }

    fn category(&self) -> &str {
        "transform"
    }
}

/// Emits its `value` parameter, ignoring inputs.
pub struct ConstantNode;

#[async_trait]
impl NodeExecutable for ConstantNode {
    fn node_type(&self) -> &str {
        "transform.constant"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::success(ctx.require_parameter("value")?.clone()))
    }

    fn validate_config(&self, parameters: &Map<String, Value>) -> Result<(), NodeError> {
        if parameters.contains_key("value") {
            Ok(())
        } else {
            Err(NodeError::InvalidParameters(
                "Missing parameter: value".to_string(),
            ))
        }
    }

    fn description(&self) -> &str {
        "Emit a fixed value"
    }

    fn category(&self) -> &str {
        "transform"
    }
}
