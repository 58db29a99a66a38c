//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the node graph wire model, the executable contract,
//! the error taxonomy, weights, and the event emitter.

mod context;
mod definition;
mod error;
pub mod events;
mod node;
mod result;
pub mod weights;

pub use context::{new_execution_id, ExecutionContext, ExecutionId};
pub use definition::{Edge, NodeDefinition, NodeId, RetryPolicy};
pub use error::{
    ErrorCode, ExecutionError, FlowError, GraphError, NodeError, RecoveryStrategy,
};
pub use events::*;
pub use node::{NodeContext, NodeExecutable, NodeLog, NodeOutput};
pub use result::{
    ExecutionResult, ExecutionTrace, NodeExecutionState, NodeTrace, ProgressPoint, TraceEvent,
    TraceEventKind,
};
pub use weights::WeightTable;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
