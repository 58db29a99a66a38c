//! Binds a [`FlowRuntime`] to a channel.

use crate::channel::{ChannelServer, HandlerError, HandlerResult};
use crate::client::ExecutionRequest;
use flowcore::NodeDefinition;
use flowruntime::FlowRuntime;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const EXECUTE_NODE: &str = "execute-node";
pub const CANCEL_EXECUTION: &str = "cancel-execution";
pub const ANALYZE_GRAPH: &str = "analyze-graph";
pub const LIST_NODE_TYPES: &str = "list-node-types";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    execution_id: String,
}

pub fn register_engine_handlers(channel: &ChannelServer, runtime: Arc<FlowRuntime>) {
    let rt = runtime.clone();
    channel.handle(EXECUTE_NODE, move |args| execute_node(rt.clone(), args));
    let rt = runtime.clone();
    channel.handle(CANCEL_EXECUTION, move |args| cancel_execution(rt.clone(), args));
    let rt = runtime.clone();
    channel.handle(ANALYZE_GRAPH, move |args| analyze_graph(rt.clone(), args));
    channel.handle(LIST_NODE_TYPES, move |_| list_node_types(runtime.clone()));
}

async fn execute_node(runtime: Arc<FlowRuntime>, args: Value) -> HandlerResult {
    let request: ExecutionRequest = serde_json::from_value(args)?;
    let result = runtime.execute(&request.node, request.context).await;
    Ok(serde_json::to_value(result)?)
}

async fn cancel_execution(runtime: Arc<FlowRuntime>, args: Value) -> HandlerResult {
    let request: CancelRequest = serde_json::from_value(args)?;
    let cancelled = runtime.cancel(&request.execution_id);
    Ok(json!({ "executionId": request.execution_id, "cancelled": cancelled }))
}

async fn analyze_graph(runtime: Arc<FlowRuntime>, args: Value) -> HandlerResult {
    // Accept `{node}` as sent by clients, or a bare definition.
    let node = match args {
        Value::Object(mut fields) if fields.contains_key("node") => {
            fields.remove("node").unwrap_or(Value::Null)
        }
        other => other,
    };
    let node: NodeDefinition = serde_json::from_value(node)?;
    let graph = runtime
        .analyze(&node)
        .map_err(|e| HandlerError::new(format!("{}: {}", e.code(), e)))?;

    let mut summary = serde_json::to_value(graph.summary())?;
    summary["unknownTypes"] = json!(runtime.unknown_node_types(&node));
    Ok(summary)
}

async fn list_node_types(runtime: Arc<FlowRuntime>) -> HandlerResult {
    let registry = runtime.registry();
    let nodes: Vec<Value> = registry
        .list_node_types()
        .into_iter()
        .filter_map(|node_type| registry.get_metadata(&node_type))
        .map(|metadata| {
            json!({
                "type": metadata.node_type,
                "description": metadata.description,
                "category": metadata.category,
            })
        })
        .collect();
    Ok(Value::Array(nodes))
}

/// Forward every runtime event to the channel's observers, under the event's
/// kind. Runs until the runtime's bus closes.
pub fn spawn_event_bridge(channel: Arc<ChannelServer>, runtime: &FlowRuntime) -> JoinHandle<()> {
    let mut events = runtime.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_value(&event) {
                    Ok(data) => {
                        channel.broadcast(event.kind().as_str(), data);
                    }
                    Err(e) => tracing::error!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event bridge lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!(channel = %channel.name(), "Event bridge stopped");
    })
}
