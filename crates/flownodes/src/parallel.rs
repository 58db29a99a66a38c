use async_trait::async_trait;
use flowcore::{NodeContext, NodeError, NodeExecutable, NodeLog, NodeOutput};
use flowruntime::{
    execute_strategy, ItemResult, NodeRegistry, Strategy, StrategyConfig, StrategyOutcome,
    DEFAULT_CONCURRENCY,
};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Runs another node type once per input item under a fan-out strategy.
///
/// Parameters: `nodeType` (required), `parameters` (passed to every item),
/// `strategy` (`all` | `race` | `allSettled`), `concurrency`, `timeoutMs`
/// and `globalTimeoutMs`. Items come from the `items` field of the input, or
/// the input itself when it is an array.
pub struct ParallelNode {
    registry: Weak<NodeRegistry>,
}

impl ParallelNode {
    /// Holds a weak handle so the registry can own this node without a cycle.
    pub fn new(registry: &Arc<NodeRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

struct FanOut {
    node_type: String,
    parameters: Map<String, Value>,
    config: StrategyConfig,
}

impl FanOut {
    fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, NodeError> {
        let node_type = parameters
            .get("nodeType")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::InvalidParameters("nodeType must be a string".into()))?
            .to_string();

        let strategy = match parameters.get("strategy") {
            None => Strategy::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                NodeError::InvalidParameters(format!(
                    "strategy must be one of all, race, allSettled; got {}",
                    value
                ))
            })?,
        };

        let concurrency = match parameters.get("concurrency") {
            None => DEFAULT_CONCURRENCY,
            Some(value) => match value.as_u64() {
                Some(n) if n > 0 => n as usize,
                _ => {
                    return Err(NodeError::InvalidParameters(
                        "concurrency must be a positive integer".into(),
                    ))
                }
            },
        };

        let mut config = StrategyConfig {
            strategy,
            concurrency,
            ..StrategyConfig::default()
        };
        if let Some(ms) = millis(parameters, "timeoutMs")? {
            config.operation_timeout = Some(ms);
        }
        config.global_timeout = millis(parameters, "globalTimeoutMs")?;

        let item_parameters = match parameters.get("parameters") {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(NodeError::InvalidParameters(
                    "parameters must be an object".into(),
                ))
            }
        };

        Ok(Self {
            node_type,
            parameters: item_parameters,
            config,
        })
    }
}

fn millis(parameters: &Map<String, Value>, key: &str) -> Result<Option<Duration>, NodeError> {
    match parameters.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| NodeError::InvalidParameters(format!("{} must be an integer", key))),
    }
}

fn items_of(inputs: &Value) -> Result<Vec<Value>, NodeError> {
    let items = match inputs {
        Value::Array(_) => inputs,
        _ => inputs
            .get("items")
            .ok_or_else(|| NodeError::MissingInput("items".into()))?,
    };
    items
        .as_array()
        .cloned()
        .ok_or_else(|| NodeError::InvalidInputType {
            field: "items".into(),
            expected: "array".into(),
            actual: "non-array".into(),
        })
}

fn settled(result: ItemResult<Value>) -> Value {
    match result.outcome {
        Ok(value) => json!({"index": result.index, "status": "fulfilled", "value": value}),
        Err(err) => json!({"index": result.index, "status": "rejected", "reason": err.to_string()}),
    }
}

#[async_trait]
impl NodeExecutable for ParallelNode {
    fn node_type(&self) -> &str {
        "flow.parallel"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let fan_out = FanOut::from_parameters(&ctx.parameters)?;
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| NodeError::ExecutionFailed("Node registry is no longer available".into()))?;
        let executable = registry.get(&fan_out.node_type).ok_or_else(|| {
            NodeError::InvalidParameters(format!("Unknown node type: {}", fan_out.node_type))
        })?;
        executable.validate_config(&fan_out.parameters)?;

        let items = items_of(&ctx.inputs)?;
        ctx.log.info(format!(
            "Running {} x {} ({:?}, concurrency {})",
            items.len(),
            fan_out.node_type,
            fan_out.config.strategy,
            fan_out.config.concurrency
        ));

        let processor = |item: Value, index: usize| {
            let executable = executable.clone();
            let node_id = format!("{}[{}]", ctx.node_id, index);
            let item_ctx = NodeContext {
                log: NodeLog::new(ctx.execution_id.clone(), node_id.clone()),
                node_id,
                execution_id: ctx.execution_id.clone(),
                inputs: item,
                parameters: fan_out.parameters.clone(),
                variables: ctx.variables.clone(),
                cancellation: ctx.cancellation.clone(),
            };
            async move {
                let output = executable.execute(item_ctx).await?;
                if output.success {
                    Ok(output.outputs)
                } else {
                    Err(NodeError::ExecutionFailed(
                        output.error.unwrap_or_else(|| "item reported failure".into()),
                    ))
                }
            }
        };

        let outputs = match execute_strategy(items, processor, fan_out.config).await? {
            StrategyOutcome::All(values) => json!({ "results": values }),
            StrategyOutcome::Race(first) => match first.outcome {
                Ok(value) => json!({ "index": first.index, "result": value }),
                Err(err) => return Err(err),
            },
            StrategyOutcome::AllSettled(results) => {
                let fulfilled = results.iter().filter(|r| r.is_ok()).count();
                let rejected = results.len() - fulfilled;
                let results: Vec<Value> = results.into_iter().map(settled).collect();
                json!({ "results": results, "fulfilled": fulfilled, "rejected": rejected })
            }
        };

        Ok(NodeOutput::success(outputs))
    }

    fn validate_config(&self, parameters: &Map<String, Value>) -> Result<(), NodeError> {
        FanOut::from_parameters(parameters).map(|_| ())
    }

    fn description(&self) -> &str {
        "Run a node type over many items with all, race or allSettled semantics"
    }

    fn category(&self) -> &str {
        "flow"
    }
}
