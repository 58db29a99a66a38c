use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionContext, ExecutionEvent, ExecutionResult, NodeDefinition};
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use flowserver::{HttpTransport, NodeExecutionClient};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a node graph file
    Run {
        /// Path to node graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Execute on a flowserver instead of in-process, e.g. http://localhost:3000
        #[arg(short, long)]
        server: Option<String>,

        /// Spread this many milliseconds of progress narration over each node
        #[arg(long, default_value_t = 0)]
        slow_mo: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Analyze a node graph file without running it
    Validate {
        /// Path to node graph JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example node graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn standard_registry() -> Arc<NodeRegistry> {
    let registry = Arc::new(NodeRegistry::new());
    flownodes::register_all(&registry);
    registry
}

fn load_graph(file: &Path) -> Result<NodeDefinition> {
    NodeDefinition::from_path(file).with_context(|| format!("Failed to load {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            server,
            slow_mo,
            verbose,
        } => {
            init_logging(verbose);
            run_graph(&file, input, server, slow_mo, verbose).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_graph(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

async fn run_graph(
    file: &Path,
    input: Option<String>,
    server: Option<String>,
    slow_mo: u64,
    verbose: bool,
) -> Result<()> {
    println!("🚀 Loading node graph from: {}", file.display());
    let node = load_graph(file)?;

    println!("📋 {} ({})", node.name.as_deref().unwrap_or(&node.id), node.node_type);
    println!("   Nodes: {}", node.nodes.len().max(1));
    println!("   Edges: {}", node.edges.len());
    println!();

    let inputs: Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("Input must be valid JSON")?,
        None => Value::Null,
    };
    let context = ExecutionContext::new()
        .with_inputs(inputs)
        .with_slow_mo(slow_mo)
        .with_debug(verbose);

    let result = match server {
        Some(url) => {
            println!("🌐 Executing on {}", url);
            let client = NodeExecutionClient::new(Arc::new(HttpTransport::new(url)));
            client.execute_node(&node, context).await
        }
        None => run_local(&node, context, verbose || slow_mo > 0).await,
    };

    print_summary(&result)
}

async fn run_local(node: &NodeDefinition, context: ExecutionContext, show_progress: bool) -> ExecutionResult {
    let runtime = FlowRuntime::with_registry(standard_registry(), RuntimeConfig::from_env());
    let mut events = runtime.subscribe_events();

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::Started(e) => {
                    println!("  ⚡ Starting node: {} ({})", e.node_id, e.node_type);
                }
                ExecutionEvent::Completed(e) if e.success => {
                    println!("  ✅ Node {} completed in {}ms", e.node_id, e.duration);
                }
                ExecutionEvent::Completed(_) => {}
                ExecutionEvent::Error(e) => {
                    println!("  ❌ Node {} failed: {}", e.node_id, e.error);
                }
                ExecutionEvent::Progress(p) if show_progress => {
                    println!(
                        "     📊 [{}] {}% - {} (run {}%)",
                        p.node_id, p.node_progress, p.message, p.progress
                    );
                }
                ExecutionEvent::Progress(_) => {}
            }
        }
    });

    tracing::debug!(node = %node.id, execution_id = %context.execution_id, "Executing in-process");
    let result = runtime.execute(node, context).await;

    // Dropping the runtime closes the bus once buffered events are read.
    drop(runtime);
    let _ = printer.await;
    result
}

fn print_summary(result: &ExecutionResult) -> Result<()> {
    println!();
    println!("📊 Execution Summary:");
    if let Some(trace) = &result.trace {
        println!("   Execution ID: {}", trace.execution_id);
    }
    if let Some(duration) = result.duration {
        println!("   Duration: {}ms", duration);
    }
    if let Some(executed) = &result.executed_nodes {
        println!("   Executed: {}", executed.join(" -> "));
    }

    if let Some(data) = &result.data {
        println!();
        println!("📤 Output:");
        println!("{}", serde_json::to_string_pretty(data)?);
    }

    match &result.error {
        Some(error) => {
            println!();
            println!("💥 {}", error);
            if let Some(node_id) = &error.node_id {
                println!("   Node: {}", node_id);
            }
            if let Some(cause) = &error.cause {
                println!("   Cause: {}", cause);
            }
            for suggestion in error.recovery().suggestions {
                println!("   Hint: {}", suggestion);
            }
            bail!("execution failed with {}", error.code)
        }
        None => {
            println!();
            println!("✨ Completed successfully");
            Ok(())
        }
    }
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating node graph: {}", file.display());

    let node = load_graph(file)?;
    let runtime = FlowRuntime::with_registry(standard_registry(), RuntimeConfig::default());

    let graph = runtime
        .analyze(&node)
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code(), e))?;

    println!("✅ Graph is valid:");
    println!("   Nodes: {}", graph.len());
    for (level, ids) in graph.execution_order().iter().enumerate() {
        println!("   Level {}: {}", level, ids.join(", "));
    }
    println!("   Critical path: {}", graph.critical_path().join(" -> "));
    println!("   Total weight: {}", graph.total_weight());
    println!("   Max parallelism: {}", graph.max_parallelism());

    let unknown = runtime.unknown_node_types(&node);
    if !unknown.is_empty() {
        println!("⚠️  Unknown node types: {}", unknown.join(", "));
    }

    let mut invalid = 0;
    for child in node.nodes.iter().filter(|child| !child.is_composite()) {
        let Some(executable) = runtime.registry().get(&child.node_type) else {
            continue;
        };
        if let Err(e) = executable.validate_config(&child.parameters) {
            println!("⚠️  Node {}: {}", child.id, e);
            invalid += 1;
        }
    }

    if !unknown.is_empty() || invalid > 0 {
        bail!("graph has {} unknown type(s) and {} invalid node(s)", unknown.len(), invalid);
    }
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = standard_registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn example_graph() -> NodeDefinition {
    let mut graph = NodeDefinition::new("example", "composite").with_name("Example fan-out");

    graph.add_node(
        NodeDefinition::new("items", "transform.constant")
            .with_name("Items")
            .with_parameter("value", json!({"items": ["alpha", "beta", "gamma"]})),
    );
    graph.add_node(
        NodeDefinition::new("fan", "flow.parallel")
            .with_name("Delay each item")
            .with_parameter("nodeType", "time.delay")
            .with_parameter("strategy", "allSettled")
            .with_parameter("concurrency", 2)
            .with_parameter("parameters", json!({"delay_ms": 250})),
    );
    graph.add_node(
        NodeDefinition::new("log", "debug.log")
            .with_name("Log results")
            .with_parameter("message", "fan-out finished"),
    );

    graph.connect("items", "fan");
    graph.connect("fan", "log");
    graph
}

fn create_example_graph(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_graph())?;
    std::fs::write(output, json)?;

    println!("✨ Created example node graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --slow-mo 600", output.display());

    Ok(())
}
