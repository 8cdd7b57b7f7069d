//! In-memory property graph
//!
//! A petgraph `StableDiGraph` keeps node indices valid across removals, and a
//! side map resolves external ids to indices.

use async_trait::async_trait;
use parking_lot::RwLock;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

use super::{AdapterHealth, GraphEdge, GraphNode, GraphStore, Payload};
use crate::errors::{MemoryError, Result};

#[derive(Debug, Clone)]
struct EdgeData {
    relation: String,
    properties: Payload,
}

#[derive(Default)]
struct GraphInner {
    graph: StableDiGraph<GraphNode, EdgeData>,
    node_map: HashMap<String, NodeIndex>,
}

impl GraphInner {
    fn edge_to_record(&self, edge: EdgeIndex) -> Option<GraphEdge> {
        let (source, target) = self.graph.edge_endpoints(edge)?;
        let data = self.graph.edge_weight(edge)?;
        Some(GraphEdge {
            from: self.graph[source].id.clone(),
            to: self.graph[target].id.clone(),
            relation: data.relation.clone(),
            properties: data.properties.clone(),
        })
    }
}

#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().graph.edge_count()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: GraphNode) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.node_map.get(&node.id) {
            inner.graph[idx] = node;
        } else {
            let id = node.id.clone();
            let idx = inner.graph.add_node(node);
            inner.node_map.insert(id, idx);
        }
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let inner = self.inner.read();
        Ok(inner.node_map.get(id).map(|&idx| inner.graph[idx].clone()))
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.node_map.remove(id) {
            Some(idx) => {
                inner.graph.remove_node(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_edge(&self, edge: GraphEdge) -> Result<()> {
        let mut inner = self.inner.write();
        let from = *inner
            .node_map
            .get(&edge.from)
            .ok_or_else(|| MemoryError::NotFound(format!("graph node {}", edge.from)))?;
        let to = *inner
            .node_map
            .get(&edge.to)
            .ok_or_else(|| MemoryError::NotFound(format!("graph node {}", edge.to)))?;
        // Same endpoints and relation: merge, replacing properties
        let existing = inner
            .graph
            .edges_directed(from, Direction::Outgoing)
            .find(|e| e.target() == to && e.weight().relation == edge.relation)
            .map(|e| e.id());
        match existing {
            Some(idx) => {
                if let Some(data) = inner.graph.edge_weight_mut(idx) {
                    data.properties = edge.properties;
                }
            }
            None => {
                inner.graph.add_edge(
                    from,
                    to,
                    EdgeData {
                        relation: edge.relation,
                        properties: edge.properties,
                    },
                );
            }
        }
        Ok(())
    }

    async fn edges(&self, id: &str, relation: Option<&str>) -> Result<Vec<GraphEdge>> {
        let inner = self.inner.read();
        let Some(&idx) = inner.node_map.get(id) else {
            return Ok(Vec::new());
        };
        let matches = |data: &EdgeData| relation.map_or(true, |r| data.relation == r);

        let mut out: Vec<GraphEdge> = inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .chain(inner.graph.edges_directed(idx, Direction::Incoming))
            .filter(|e| matches(e.weight()))
            .filter_map(|e| inner.edge_to_record(e.id()))
            .collect();
        out.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        Ok(out)
    }

    async fn neighbors(&self, id: &str, relation: Option<&str>) -> Result<Vec<GraphNode>> {
        let inner = self.inner.read();
        let Some(&idx) = inner.node_map.get(id) else {
            return Ok(Vec::new());
        };

        let mut seen = BTreeSet::new();
        for direction in [Direction::Outgoing, Direction::Incoming] {
            for edge in inner.graph.edges_directed(idx, direction) {
                if relation.map_or(false, |r| edge.weight().relation != r) {
                    continue;
                }
                let other = if edge.source() == idx {
                    edge.target()
                } else {
                    edge.source()
                };
                seen.insert(inner.graph[other].id.clone());
            }
        }
        Ok(seen
            .into_iter()
            .filter_map(|nid| inner.node_map.get(&nid).map(|&i| inner.graph[i].clone()))
            .collect())
    }

    async fn nodes_by_label(&self, label: &str, limit: usize) -> Result<Vec<GraphNode>> {
        let inner = self.inner.read();
        let mut nodes: Vec<GraphNode> = inner
            .graph
            .node_indices()
            .map(|i| &inner.graph[i])
            .filter(|n| n.label == label)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn health_check(&self) -> AdapterHealth {
        AdapterHealth::ok("graph:memory")
    }
}
