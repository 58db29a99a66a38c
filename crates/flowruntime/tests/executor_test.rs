use async_trait::async_trait;
use flowcore::{
    ErrorCode, EventEmitter, EventKind, ExecutionContext, ExecutionEvent, NodeContext,
    NodeDefinition, NodeError, NodeExecutable, NodeExecutionState, NodeOutput, ProgressEvent,
};
use flowruntime::{Backoff, Executor, FlowRuntime, NodeRegistry, RuntimeConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Returns its inputs unchanged
struct Echo;

#[async_trait]
impl NodeExecutable for Echo {
    fn node_type(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::success(ctx.inputs))
    }
}

/// Returns its `value` parameter
struct Emit;

#[async_trait]
impl NodeExecutable for Emit {
    fn node_type(&self) -> &str {
        "test.value"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::success(ctx.parameter_or("value", Value::Null)))
    }
}

/// Sleeps for `ms` without watching cancellation, then echoes
struct Slow;

#[async_trait]
impl NodeExecutable for Slow {
    fn node_type(&self) -> &str {
        "test.slow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx.parameter_or("ms", json!(1000)).as_u64().unwrap_or(1000);
        sleep(Duration::from_millis(ms)).await;
        Ok(NodeOutput::success(ctx.inputs))
    }
}

struct Failing {
    node_type: &'static str,
    soft: bool,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl NodeExecutable for Failing {
    fn node_type(&self) -> &str {
        self.node_type
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.soft {
            Ok(NodeOutput::failure(format!("soft failure {}", call)))
        } else {
            Err(NodeError::ExecutionFailed(format!("hard failure {}", call)))
        }
    }
}

struct Fixture {
    registry: Arc<NodeRegistry>,
    hard_calls: Arc<AtomicU32>,
    soft_calls: Arc<AtomicU32>,
    echo_calls: Arc<AtomicU32>,
}

/// Echo wrapper that counts how often it runs
struct CountingEcho(Arc<AtomicU32>);

#[async_trait]
impl NodeExecutable for CountingEcho {
    fn node_type(&self) -> &str {
        "test.counted"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::success(ctx.inputs))
    }
}

fn fixture() -> Fixture {
    let registry = Arc::new(NodeRegistry::new());
    let hard_calls = Arc::new(AtomicU32::new(0));
    let soft_calls = Arc::new(AtomicU32::new(0));
    let echo_calls = Arc::new(AtomicU32::new(0));

    registry.register(Arc::new(Echo));
    registry.register(Arc::new(Emit));
    registry.register(Arc::new(Slow));
    registry.register(Arc::new(CountingEcho(echo_calls.clone())));
    registry.register(Arc::new(Failing {
        node_type: "test.fail",
        soft: false,
        calls: hard_calls.clone(),
    }));
    registry.register(Arc::new(Failing {
        node_type: "test.soft_fail",
        soft: true,
        calls: soft_calls.clone(),
    }));

    Fixture {
        registry,
        hard_calls,
        soft_calls,
        echo_calls,
    }
}

fn chain(types: &[(&str, &str)]) -> NodeDefinition {
    let mut root = NodeDefinition::new("root", "composite");
    for (id, node_type) in types {
        root.add_node(NodeDefinition::new(*id, *node_type));
    }
    for pair in types.windows(2) {
        root.connect(pair[0].0, pair[1].0);
    }
    root
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn emitter() -> EventEmitter {
    EventEmitter::new(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn test_composite_fails_fast_with_partial_results() {
    init_tracing();
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let root = chain(&[("1", "test.echo"), ("2", "test.fail"), ("3", "test.counted")]);

    let report = executor
        .execute_with_state(&root, ExecutionContext::new(), &emitter())
        .await;
    let result = report.result;

    assert!(!result.success);
    assert_eq!(result.executed_nodes, Some(vec!["1".to_string(), "2".to_string()]));
    let error = result.error.expect("error is reported");
    assert_eq!(error.code, ErrorCode::ExecutionFailed);
    assert_eq!(error.node_id.as_deref(), Some("2"));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 0);

    let state = report.state;
    assert_eq!(state.node("1").map(|n| n.state), Some(NodeExecutionState::Completed));
    assert_eq!(state.node("2").map(|n| n.state), Some(NodeExecutionState::Error));
    assert_eq!(state.node("3").map(|n| n.state), Some(NodeExecutionState::Pending));
    assert!(!state.is_executing());

    let trace = result.trace.expect("trace is attached");
    assert_eq!(trace.failed_node(), Some("2"));
    assert!(!trace.nodes.contains_key("3"));
}

#[tokio::test(start_paused = true)]
async fn test_hard_failure_retried_until_exhausted() {
    init_tracing();
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let node = NodeDefinition::new("only", "test.fail");

    let result = executor.execute(&node, ExecutionContext::new(), &emitter()).await;

    assert!(!result.success);
    assert_eq!(fx.hard_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.error.map(|e| e.message),
        Some("Execution failed: hard failure 3".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_soft_failure_becomes_execution_failed() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone()).with_retries(1, Duration::from_secs(1));
    let node = NodeDefinition::new("only", "test.soft_fail");

    let result = executor.execute(&node, ExecutionContext::new(), &emitter()).await;

    assert_eq!(fx.soft_calls.load(Ordering::SeqCst), 2);
    let error = result.error.expect("error is reported");
    assert_eq!(error.code, ErrorCode::ExecutionFailed);
    assert_eq!(error.message, "soft failure 2");
    assert_eq!(error.node_id.as_deref(), Some("only"));
}

#[tokio::test(start_paused = true)]
async fn test_node_retry_policy_overrides_default() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let node = NodeDefinition::new("only", "test.fail").with_retry(0, 1000);

    executor.execute(&node, ExecutionContext::new(), &emitter()).await;
    assert_eq!(fx.hard_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_reported() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let node = NodeDefinition::new("slow", "test.slow")
        .with_parameter("ms", 10_000)
        .with_retry(0, 50);

    let result = executor.execute(&node, ExecutionContext::new(), &emitter()).await;
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::Timeout));
}

#[tokio::test]
async fn test_missing_registry() {
    let executor = Executor::without_registry();
    let node = NodeDefinition::new("n", "test.echo");

    let result = executor.execute(&node, ExecutionContext::new(), &emitter()).await;
    let error = result.error.expect("error is reported");
    assert_eq!(error.code, ErrorCode::NoExecutorFactory);
    assert_eq!(error.node_id.as_deref(), Some("n"));
}

#[tokio::test]
async fn test_unknown_node_type() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let root = chain(&[("a", "test.echo"), ("b", "does.not.exist")]);

    let result = executor.execute(&root, ExecutionContext::new(), &emitter()).await;
    let error = result.error.expect("error is reported");
    assert_eq!(error.code, ErrorCode::NodeTypeNotFound);
    assert_eq!(error.node_id.as_deref(), Some("b"));
    assert_eq!(result.executed_nodes, Some(vec!["a".to_string(), "b".to_string()]));
}

#[tokio::test]
async fn test_cycle_is_rejected_before_running() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let mut root = chain(&[("a", "test.counted"), ("b", "test.counted")]);
    root.connect("b", "a");

    let result = executor.execute(&root, ExecutionContext::new(), &emitter()).await;
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::CircularDependency));
    assert_eq!(result.executed_nodes, Some(Vec::new()));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_outputs_flow_along_edges() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());

    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("src", "test.value").with_parameter("value", json!({"n": 7})));
    root.add_node(NodeDefinition::new("mid", "test.echo"));
    root.add_node(NodeDefinition::new("sink", "test.echo"));
    root.connect("src", "mid");
    root.connect("mid", "sink").source_port("n");

    let report = executor
        .execute_with_state(&root, ExecutionContext::new().with_inputs(json!("seed")), &emitter())
        .await;

    assert!(report.result.success);
    assert_eq!(report.result.data, Some(json!(7)));
    assert_eq!(report.state.get_execution_progress(), 100);
    assert_eq!(
        report.state.get_nodes_by_state(NodeExecutionState::Completed),
        vec!["src", "mid", "sink"]
    );
}

#[tokio::test]
async fn test_root_nodes_receive_composite_input() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let root = chain(&[("a", "test.echo")]);

    let result = executor
        .execute(&root, ExecutionContext::new().with_inputs(json!({"seed": true})), &emitter())
        .await;
    assert_eq!(result.data, Some(json!({"seed": true})));
}

#[tokio::test(start_paused = true)]
async fn test_events_are_emitted() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let root = chain(&[("a", "test.echo"), ("b", "test.echo")]);

    let emitter = emitter();
    let seen: Arc<Mutex<Vec<ExecutionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let seen = seen.clone();
        emitter.on(kind, move |event| seen.lock().unwrap().push(event.clone()));
    }

    let result = executor.execute(&root, ExecutionContext::new(), &emitter).await;
    assert!(result.success);

    let events = seen.lock().unwrap();
    let started: Vec<&str> = events
        .iter()
        .filter(|e| e.kind() == EventKind::Started)
        .map(|e| e.node_id())
        .collect();
    assert_eq!(started, vec!["root", "a", "b"]);
    let graphs: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Started(s) => Some(s.graph.is_some()),
            _ => None,
        })
        .collect();
    assert_eq!(graphs, vec![true, false, false]);

    let completed = events.iter().filter(|e| e.kind() == EventKind::Completed).count();
    assert_eq!(completed, 3);
    assert!(events.iter().all(|e| e.kind() != EventKind::Error));

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Progress(p) => Some(p),
            _ => None,
        })
        .collect();
    let last = progress.last().expect("progress was emitted");
    assert_eq!(last.node_id, "b");
    assert_eq!(last.progress, 100);
    assert_eq!(last.nodes.len(), 2);
}

fn progress_recorder(emitter: &EventEmitter) -> Arc<Mutex<Vec<ProgressEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    emitter.on(EventKind::Progress, move |event| {
        if let ExecutionEvent::Progress(p) = event {
            sink.lock().unwrap().push(p.clone());
        }
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn test_progress_reports_weighted_run_completion() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let root = chain(&[("a", "test.echo"), ("b", "test.echo")]);

    let emitter = emitter();
    let seen = progress_recorder(&emitter);
    let result = executor.execute(&root, ExecutionContext::new(), &emitter).await;
    assert!(result.success);

    let seen = seen.lock().unwrap();
    let after_a = seen.iter().find(|p| p.node_id == "a").expect("progress for a");
    assert_eq!(after_a.node_progress, 100);
    assert_eq!(after_a.progress, 50);
    assert!(after_a.estimated_time_remaining.is_some());

    let last = seen.last().expect("progress was emitted");
    assert_eq!(last.progress, 100);
    assert_eq!(last.estimated_time_remaining, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_node_state_reaches_observers() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone()).with_retries(0, Duration::from_secs(1));
    let root = chain(&[("a", "test.echo"), ("b", "test.fail")]);

    let emitter = emitter();
    let seen = progress_recorder(&emitter);
    let order = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::Progress, EventKind::Error] {
        let order = order.clone();
        emitter.on(kind, move |event| order.lock().unwrap().push(event.kind()));
    }

    let result = executor.execute(&root, ExecutionContext::new(), &emitter).await;
    assert!(!result.success);

    let seen = seen.lock().unwrap();
    let failed = seen
        .iter()
        .flat_map(|p| p.nodes.iter())
        .find(|n| n.id == "b" && n.state == NodeExecutionState::Error)
        .expect("a snapshot shows b in error");
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("hard failure 1")));

    let last = seen.last().expect("progress was emitted");
    assert_eq!(last.progress, 50);
    // The failed snapshot is delivered before the first error event.
    let order = order.lock().unwrap();
    assert_eq!(order.first(), Some(&EventKind::Progress));
    let first_error = order.iter().position(|k| *k == EventKind::Error).expect("error emitted");
    assert_eq!(order[first_error - 1], EventKind::Progress);
}

#[tokio::test(start_paused = true)]
async fn test_graph_summary_survives_reused_emitter() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let emitter = emitter();
    let graphs = Arc::new(AtomicU32::new(0));
    let counter = graphs.clone();
    emitter.on(EventKind::Started, move |event| {
        if let ExecutionEvent::Started(s) = event {
            if s.graph.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // Back to back, inside one throttle window.
    for _ in 0..2 {
        let root = chain(&[("a", "test.echo"), ("b", "test.echo")]);
        executor.execute(&root, ExecutionContext::new(), &emitter).await;
    }
    assert_eq!(graphs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_emits_error_event() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone()).with_backoff(Backoff::new(
        Duration::from_millis(10),
        Duration::from_millis(10),
    ));
    let node = NodeDefinition::new("boom", "test.fail");

    let emitter = emitter();
    let errors = Arc::new(AtomicU32::new(0));
    let counter = errors.clone();
    emitter.on(EventKind::Error, move |event| {
        assert_eq!(event.node_id(), "boom");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    executor.execute(&node, ExecutionContext::new(), &emitter).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_scheduling() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("a", "test.slow").with_parameter("ms", 1000));
    root.add_node(NodeDefinition::new("b", "test.counted"));
    root.connect("a", "b");

    let ctx = ExecutionContext::new();
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let report = executor.execute_with_state(&root, ctx, &emitter()).await;

    assert_eq!(report.result.error.map(|e| e.code), Some(ErrorCode::Cancelled));
    assert_eq!(report.result.executed_nodes, Some(vec!["a".to_string()]));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 0);
    // The running node was abandoned, not killed; only unstarted nodes are cancelled.
    assert_eq!(report.state.node("a").map(|n| n.state), Some(NodeExecutionState::Completed));
    assert_eq!(report.state.node("b").map(|n| n.state), Some(NodeExecutionState::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_nodes_reach_observers() {
    let fx = fixture();
    let executor = Executor::new(fx.registry.clone());
    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("a", "test.slow").with_parameter("ms", 1000));
    root.add_node(NodeDefinition::new("b", "test.counted"));
    root.connect("a", "b");

    let emitter = emitter();
    let seen = progress_recorder(&emitter);
    let ctx = ExecutionContext::new();
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        token.cancel();
    });
    executor.execute(&root, ctx, &emitter).await;

    let seen = seen.lock().unwrap();
    let last = seen.last().expect("progress was emitted");
    let b = last.nodes.iter().find(|n| n.id == "b").expect("b is tracked");
    assert_eq!(b.state, NodeExecutionState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_runs_concurrently_and_forwards_events() {
    let fx = fixture();
    let runtime = FlowRuntime::with_registry(fx.registry.clone(), RuntimeConfig::default());
    let mut events = runtime.subscribe_events();

    let mut slow = NodeDefinition::new("root", "composite");
    slow.add_node(NodeDefinition::new("wait", "test.slow").with_parameter("ms", 200));
    let fast = chain(&[("x", "test.echo")]);

    let (first, second) = tokio::join!(
        runtime.execute(&slow, ExecutionContext::new().with_execution_id("run-1")),
        runtime.execute(&fast, ExecutionContext::new().with_execution_id("run-2")),
    );
    assert!(first.success && second.success);
    assert!(runtime.active_executions().is_empty());

    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        ids.push(event.execution_id().to_string());
    }
    assert!(ids.iter().any(|id| id == "run-1"));
    assert!(ids.iter().any(|id| id == "run-2"));
}

#[tokio::test(start_paused = true)]
async fn test_runtime_cancel_and_duplicate_ids() {
    let fx = fixture();
    let runtime = FlowRuntime::with_registry(fx.registry.clone(), RuntimeConfig::default());

    let mut root = NodeDefinition::new("root", "composite");
    root.add_node(NodeDefinition::new("a", "test.slow").with_parameter("ms", 1000));
    root.add_node(NodeDefinition::new("b", "test.counted"));
    root.connect("a", "b");

    let run = runtime.execute(&root, ExecutionContext::new().with_execution_id("dup"));
    let interfere = async {
        sleep(Duration::from_millis(100)).await;
        let duplicate = runtime
            .execute(&root, ExecutionContext::new().with_execution_id("dup"))
            .await;
        assert_eq!(runtime.active_executions(), vec!["dup"]);
        let cancelled = runtime.cancel("dup");
        (duplicate, cancelled)
    };

    let (result, (duplicate, cancelled)) = tokio::join!(run, interfere);

    assert!(cancelled);
    assert_eq!(duplicate.error.map(|e| e.code), Some(ErrorCode::ValidationFailed));
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::Cancelled));
    assert_eq!(fx.echo_calls.load(Ordering::SeqCst), 0);
    assert!(!runtime.cancel("dup"));
}
