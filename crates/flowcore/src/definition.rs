use crate::FlowError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub type NodeId = String;

/// A node in a workflow graph. Nodes with children are composites and run
/// their children as a sub-graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_version() -> String {
    "1".to_string()
}

impl NodeDefinition {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            version: default_version(),
            name: None,
            parameters: Map::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            retry: None,
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, max_retries: u32, timeout_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_retries,
            timeout_ms,
        });
        self
    }

    pub fn with_child(mut self, child: NodeDefinition) -> Self {
        self.nodes.push(child);
        self
    }

    pub fn add_node(&mut self, node: NodeDefinition) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Connect two children, generating an edge id from the endpoints.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> &mut Edge {
        let source = source.into();
        let target = target.into();
        self.edges.push(Edge::new(format!("{}->{}", source, target), source, target));
        let last = self.edges.len() - 1;
        &mut self.edges[last]
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// Data-flow edge between two sibling nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn source_port(&mut self, handle: impl Into<String>) -> &mut Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn target_port(&mut self, handle: impl Into<String>) -> &mut Self {
        self.target_handle = Some(handle.into());
        self
    }
}

/// Per-node override of the executor's retry/timeout defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_shape() {
        let def = NodeDefinition::from_json_str(
            r#"{
                "id": "root",
                "type": "composite",
                "nodes": [
                    {"id": "a", "type": "debug.log", "parameters": {"level": "info"}},
                    {"id": "b", "type": "time.delay", "version": "2"}
                ],
                "edges": [{"id": "e1", "source": "a", "target": "b", "sourceHandle": "out"}]
            }"#,
        )
        .unwrap();

        assert!(def.is_composite());
        assert_eq!(def.version, "1");
        assert_eq!(def.nodes[1].version, "2");
        assert_eq!(def.nodes[0].parameters["level"], json!("info"));
        assert_eq!(def.edges[0].source_handle.as_deref(), Some("out"));
        assert!(def.edges[0].target_handle.is_none());
    }

    #[test]
    fn test_connect_builds_edges() {
        let mut def = NodeDefinition::new("root", "composite");
        let a = def.add_node(NodeDefinition::new("a", "debug.log"));
        let b = def.add_node(NodeDefinition::new("b", "debug.log"));
        def.connect(a, b).source_port("message").target_port("text");

        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["edges"][0]["id"], "a->b");
        assert_eq!(json["edges"][0]["targetHandle"], "text");
        assert!(json.get("retry").is_none());
    }
}
