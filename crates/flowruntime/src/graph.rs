//! Graph analysis: topological leveling, cycle detection, critical path and
//! parallelism estimates. Everything here is pure; an [`ExecutionGraph`] is
//! built once per run and never mutated.

use flowcore::{Edge, GraphError, GraphSummary, NodeDefinition, NodeId, WeightTable};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Analysis result for one node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub node_type: String,
    pub weight: u64,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPath {
    pub path: Vec<NodeId>,
    pub weight: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: HashMap<NodeId, GraphNode>,
    execution_order: Vec<Vec<NodeId>>,
    critical_path: Vec<NodeId>,
    total_weight: u64,
    max_parallelism: usize,
    edges: Vec<Edge>,
}

impl ExecutionGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn execution_order(&self) -> &[Vec<NodeId>] {
        &self.execution_order
    }

    /// Node ids in execution order, levels flattened.
    pub fn ordered_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.execution_order.iter().flatten()
    }

    pub fn critical_path(&self) -> &[NodeId] {
        &self.critical_path
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            execution_order: self.execution_order.clone(),
            critical_path: self.critical_path.clone(),
            total_weight: self.total_weight,
            max_parallelism: self.max_parallelism,
            edges: self.edges.clone(),
        }
    }
}

/// Build the execution graph for a node. Atomic nodes produce a trivial
/// single-node graph; composites are analysed from their children.
pub fn analyze_execution_graph(
    node: &NodeDefinition,
    weights: &WeightTable,
) -> Result<ExecutionGraph, GraphError> {
    if !node.is_composite() {
        let weight = weights.weight_of(&node.node_type);
        let mut nodes = HashMap::new();
        nodes.insert(
            node.id.clone(),
            GraphNode {
                node_type: node.node_type.clone(),
                weight,
                dependencies: Vec::new(),
                dependents: Vec::new(),
                level: 0,
            },
        );
        return Ok(ExecutionGraph {
            nodes,
            execution_order: vec![vec![node.id.clone()]],
            critical_path: vec![node.id.clone()],
            total_weight: weight,
            max_parallelism: 1,
            edges: Vec::new(),
        });
    }

    let children = &node.nodes;
    let edges = &node.edges;
    let dag = DependencyGraph::build(children, edges)?;
    let execution_order = dag.levels()?;
    let critical = dag.critical_path(&execution_order, weights);

    let mut nodes = HashMap::with_capacity(children.len());
    for (level, ids) in execution_order.iter().enumerate() {
        for id in ids {
            let idx = dag.index[id.as_str()];
            let child = &children[dag.graph[idx]];
            nodes.insert(
                id.clone(),
                GraphNode {
                    node_type: child.node_type.clone(),
                    weight: weights.weight_of(&child.node_type),
                    dependencies: dag.neighbor_ids(idx, Direction::Incoming),
                    dependents: dag.neighbor_ids(idx, Direction::Outgoing),
                    level,
                },
            );
        }
    }

    let total_weight = nodes.values().map(|n| n.weight).sum();
    let max_parallelism = find_parallel_branches(&execution_order);

    Ok(ExecutionGraph {
        nodes,
        execution_order,
        critical_path: critical.path,
        total_weight,
        max_parallelism,
        edges: edges.clone(),
    })
}

/// Kahn's algorithm, one level per extraction round. Nodes within a level
/// keep their declaration order.
pub fn topological_sort(
    nodes: &[NodeDefinition],
    edges: &[Edge],
) -> Result<Vec<Vec<NodeId>>, GraphError> {
    DependencyGraph::build(nodes, edges)?.levels()
}

pub fn find_critical_path(
    nodes: &[NodeDefinition],
    edges: &[Edge],
    weights: &WeightTable,
) -> Result<CriticalPath, GraphError> {
    let dag = DependencyGraph::build(nodes, edges)?;
    let order = dag.levels()?;
    Ok(dag.critical_path(&order, weights))
}

pub fn find_parallel_branches(execution_order: &[Vec<NodeId>]) -> usize {
    execution_order.iter().map(Vec::len).max().unwrap_or(0)
}

/// Sibling nodes as a petgraph, node weights being indices into the slice.
struct DependencyGraph<'a> {
    nodes: &'a [NodeDefinition],
    graph: DiGraph<usize, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> DependencyGraph<'a> {
    fn build(nodes: &'a [NodeDefinition], edges: &[Edge]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for (position, node) in nodes.iter().enumerate() {
            let idx = graph.add_node(position);
            if index.insert(node.id.as_str(), idx).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        for edge in edges {
            let from = index
                .get(edge.source.as_str())
                .ok_or_else(|| GraphError::NodeNotFound(edge.source.clone()))?;
            let to = index
                .get(edge.target.as_str())
                .ok_or_else(|| GraphError::NodeNotFound(edge.target.clone()))?;
            graph.add_edge(*from, *to, ());
        }

        Ok(Self {
            nodes,
            graph,
            index,
        })
    }

    fn id(&self, idx: NodeIndex) -> &'a NodeId {
        &self.nodes[self.graph[idx]].id
    }

    fn neighbor_ids(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = Vec::new();
        for neighbor in self.graph.neighbors_directed(idx, direction) {
            let id = self.id(neighbor);
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        // petgraph yields neighbors newest-edge first.
        ids.reverse();
        ids
    }

    fn levels(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .collect();
        let mut levels = Vec::new();
        let mut emitted = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for idx in &current {
                for dependent in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    let degree = &mut in_degree[dependent.index()];
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
            emitted += current.len();
            levels.push(current.iter().map(|idx| self.id(*idx).clone()).collect());
            next.sort_by_key(|idx| self.graph[*idx]);
            current = next;
        }

        if emitted < self.nodes.len() {
            let remaining = self
                .graph
                .node_indices()
                .filter(|idx| in_degree[idx.index()] > 0)
                .map(|idx| self.id(idx).clone())
                .collect();
            return Err(GraphError::CycleDetected { remaining });
        }

        Ok(levels)
    }

    fn critical_path(&self, order: &[Vec<NodeId>], weights: &WeightTable) -> CriticalPath {
        let count = self.graph.node_count();
        let mut best = vec![0u64; count];
        let mut previous: Vec<Option<NodeIndex>> = vec![None; count];
        let mut end: Option<NodeIndex> = None;

        for id in order.iter().flatten() {
            let idx = self.index[id.as_str()];
            let own = weights.weight_of(&self.nodes[self.graph[idx]].node_type);

            let heaviest = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .max_by_key(|pred| (best[pred.index()], std::cmp::Reverse(self.graph[*pred])));
            best[idx.index()] = own + heaviest.map_or(0, |pred| best[pred.index()]);
            previous[idx.index()] = heaviest;

            if end.map_or(true, |e| best[idx.index()] > best[e.index()]) {
                end = Some(idx);
            }
        }

        let Some(end) = end else {
            return CriticalPath {
                path: Vec::new(),
                weight: 0,
            };
        };

        let mut path = vec![self.id(end).clone()];
        let mut cursor = previous[end.index()];
        while let Some(idx) = cursor {
            path.push(self.id(idx).clone());
            cursor = previous[idx.index()];
        }
        path.reverse();

        CriticalPath {
            path,
            weight: best[end.index()],
        }
    }
}
