use async_trait::async_trait;
use flowcore::{NodeContext, NodeError, NodeExecutable, NodeOutput};
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration, then pass inputs through.
pub struct DelayNode;

#[async_trait]
impl NodeExecutable for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .parameters
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);

        ctx.log.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(NodeOutput::success(ctx.inputs)),
            _ = ctx.cancellation.cancelled() => {
                ctx.log.debug("Delay interrupted by cancellation");
                Err(NodeError::Cancelled)
            }
        }
    }

    fn validate_config(&self, parameters: &Map<String, Value>) -> Result<(), NodeError> {
        match parameters.get("delay_ms") {
            None => Ok(()),
            Some(value) if value.as_u64().is_some() => Ok(()),
            Some(other) => Err(NodeError::InvalidParameters(format!(
                "delay_ms must be a non-negative integer, got {}",
                other
            ))),
        }
    }

    fn description(&self) -> &str {
        "Delay execution for specified milliseconds"
    }

    fn category(&self) -> &str {
        "time"
    }
}
