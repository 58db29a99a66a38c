//! Execution engine for node graphs
//!
//! Analyzes a graph into levels and a critical path, runs it with
//! retry/timeout/fail-fast semantics, tracks live per-node state and
//! publishes progress through the run's event emitter.

mod executor;
mod graph;
mod parallel;
mod registry;
mod retry;
mod runtime;
mod state;

pub use executor::{
    resolve_inputs, Checkpoint, ExecutionReport, Executor, ProgressNarrator, SilentNarrator,
    SlowMoNarrator, DEFAULT_MAX_RETRIES, DEFAULT_NODE_TIMEOUT,
};
pub use graph::{
    analyze_execution_graph, find_critical_path, find_parallel_branches, topological_sort,
    CriticalPath, ExecutionGraph, GraphNode,
};
pub use parallel::{
    execute_strategy, process_in_chunks, ChunkOptions, ItemResult, Strategy, StrategyConfig,
    StrategyError, StrategyOutcome, DEFAULT_CONCURRENCY, DEFAULT_OPERATION_TIMEOUT,
};
pub use registry::{NodeMetadata, NodeRegistry};
pub use retry::{execute_with_retries, Backoff};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use state::{ExecutionStateStore, NodeRuntimeState, StateError};
