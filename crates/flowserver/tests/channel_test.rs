use flowcore::{ErrorCode, ExecutionContext, NodeDefinition};
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use flowserver::engine::{ANALYZE_GRAPH, CANCEL_EXECUTION, LIST_NODE_TYPES};
use flowserver::{
    register_engine_handlers, spawn_event_bridge, ChannelResponse, ChannelServer,
    InProcessTransport, NodeExecutionClient, Transport, TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine_channel() -> (Arc<ChannelServer>, Arc<FlowRuntime>) {
    let registry = Arc::new(NodeRegistry::new());
    flownodes::register_all(&registry);
    let runtime = Arc::new(FlowRuntime::with_registry(registry, RuntimeConfig::default()));
    let channel = Arc::new(ChannelServer::new("engine-test"));
    register_engine_handlers(&channel, runtime.clone());
    (channel, runtime)
}

fn pipeline() -> NodeDefinition {
    let mut root = NodeDefinition::new("pipeline", "composite");
    root.add_node(NodeDefinition::new("const", "transform.constant").with_parameter("value", json!([1, 2])));
    root.add_node(NodeDefinition::new("log", "debug.log"));
    root.connect("const", "log");
    root
}

#[tokio::test]
async fn test_client_executes_through_channel() {
    let (channel, _runtime) = engine_channel();
    let client = NodeExecutionClient::new(Arc::new(InProcessTransport::new(channel)));

    let result = client
        .execute_node(&pipeline(), ExecutionContext::new().with_execution_id("remote-1"))
        .await;

    assert!(result.success, "remote run failed: {:?}", result.error);
    assert_eq!(result.data, Some(json!([1, 2])));
    assert_eq!(
        result.executed_nodes,
        Some(vec!["const".to_string(), "log".to_string()])
    );
    let trace = result.trace.expect("trace crosses the channel");
    assert_eq!(trace.execution_id, "remote-1");
}

#[tokio::test]
async fn test_node_failure_crosses_channel_as_result() {
    let (channel, _runtime) = engine_channel();
    let client = NodeExecutionClient::new(Arc::new(InProcessTransport::new(channel)));

    let result = client
        .execute(json!({"node": {"id": "ghost", "type": "no.such.type"}}))
        .await;

    let error = result.error.expect("unknown type is reported");
    assert_eq!(error.code, ErrorCode::NodeTypeNotFound);
    assert_eq!(error.node_id.as_deref(), Some("ghost"));
}

#[tokio::test]
async fn test_events_reach_observers() {
    let (channel, runtime) = engine_channel();
    let mut observer = channel.connect();
    let bridge = spawn_event_bridge(channel.clone(), &runtime);

    let response = channel
        .dispatch(
            flowserver::engine::EXECUTE_NODE,
            json!({"node": pipeline(), "context": {"executionId": "observed"}}),
        )
        .await;
    assert!(response.is_success());

    let mut kinds = Vec::new();
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_millis(200), observer.recv()).await
    {
        assert_eq!(message.data["executionId"], json!("observed"));
        kinds.push(message.event);
    }
    bridge.abort();

    assert!(kinds.iter().any(|k| k == "started"));
    assert!(kinds.iter().any(|k| k == "progress"));
    assert_eq!(kinds.last().map(String::as_str), Some("completed"));
}

#[tokio::test]
async fn test_analyze_and_list_handlers() {
    let (channel, _runtime) = engine_channel();
    let transport = InProcessTransport::new(channel);

    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("a", "transform.constant"));
    root.add_node(NodeDefinition::new("b", "http.request"));
    root.add_node(NodeDefinition::new("c", "debug.log"));
    root.connect("a", "b");
    root.connect("a", "c");

    let summary = transport
        .call(ANALYZE_GRAPH, json!({ "node": root }))
        .await
        .expect("analysis succeeds");
    assert_eq!(summary["executionOrder"], json!([["a"], ["b", "c"]]));
    assert_eq!(summary["maxParallelism"], json!(2));
    assert_eq!(summary["criticalPath"], json!(["a", "b"]));
    assert_eq!(summary["unknownTypes"], json!(["http.request"]));

    root.connect("b", "a");
    match transport.call(ANALYZE_GRAPH, json!({ "node": root })).await {
        Err(TransportError::Handler(message)) => {
            assert!(message.starts_with("CIRCULAR_DEPENDENCY"), "{}", message)
        }
        other => panic!("expected cycle error, got {:?}", other),
    }

    let nodes = transport.call(LIST_NODE_TYPES, json!(null)).await.unwrap();
    let types: Vec<&str> = nodes
        .as_array()
        .expect("array of node types")
        .iter()
        .filter_map(|n| n["type"].as_str())
        .collect();
    assert!(types.contains(&"flow.parallel"));
    assert!(types.contains(&"time.delay"));
}

#[tokio::test]
async fn test_cancel_over_channel() {
    let (channel, runtime) = engine_channel();

    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("wait", "time.delay").with_parameter("delay_ms", 60_000));
    root.add_node(NodeDefinition::new("after", "debug.log"));
    root.connect("wait", "after");

    let run = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .execute(&root, ExecutionContext::new().with_execution_id("long"))
                .await
        })
    };

    while runtime.active_executions().is_empty() {
        tokio::task::yield_now().await;
    }

    let response = channel
        .dispatch(CANCEL_EXECUTION, json!({"executionId": "long"}))
        .await;
    assert_eq!(
        response,
        ChannelResponse::Success {
            result: json!({"executionId": "long", "cancelled": true})
        }
    );

    let result = run.await.expect("run task completes");
    let error = result.error.expect("run was cancelled");
    assert_eq!(error.code, ErrorCode::Cancelled);
    assert_eq!(error.node_id.as_deref(), Some("wait"));
    assert_eq!(result.executed_nodes, Some(vec!["wait".to_string()]));
}
