use flowcore::NodeExecutable;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metadata about a node type
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetadata {
    pub node_type: String,
    pub description: String,
    pub category: String,
}

/// Registry of available node types.
///
/// Constructed once at startup and shared read-mostly across runs; all
/// mutation goes through the internal lock.
pub struct NodeRegistry {
    executables: RwLock<HashMap<String, Arc<dyn NodeExecutable>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            executables: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executable under its own node type, replacing any previous one
    pub fn register(&self, executable: Arc<dyn NodeExecutable>) {
        let node_type = executable.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        if self.write().insert(node_type.clone(), executable).is_some() {
            tracing::warn!("Replaced existing executable for node type: {}", node_type);
        }
    }

    pub fn unregister(&self, node_type: &str) -> bool {
        self.write().remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutable>> {
        self.read().get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.read().contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.get(node_type).map(|executable| NodeMetadata {
            node_type: node_type.to_string(),
            description: executable.description().to_string(),
            category: executable.category().to_string(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn NodeExecutable>>> {
        self.executables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn NodeExecutable>>> {
        self.executables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
