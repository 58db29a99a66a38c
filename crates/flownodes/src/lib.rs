//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod parallel;
mod time;
mod transform;

pub use debug::DebugNode;
pub use parallel::ParallelNode;
pub use time::DelayNode;
pub use transform::{ConstantNode, JsonParseNode, JsonStringifyNode};

use flowruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &Arc<NodeRegistry>) {
    registry.register(Arc::new(DebugNode));
    registry.register(Arc::new(DelayNode));
    registry.register(Arc::new(JsonParseNode));
    registry.register(Arc::new(JsonStringifyNode));
    registry.register(Arc::new(ConstantNode));
    registry.register(Arc::new(ParallelNode::new(registry)));
}
