//! Graph storage contract (spec.md §4.1.3).
//!
//! A directed, multigraph-*flavored* store: at most one edge per ordered
//! pair `(src, tgt)`, but an edge's attributes are themselves the result
//! of merging every extraction that produced that pair. Labels and
//! relation types must already be sanitized to `[A-Za-z0-9_]+` by the
//! caller before they reach `upsert_edge`/`upsert_edges_batch`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde_json::Value;

use crate::error::Result;
use crate::models::{ClusterRef, GRAPH_FIELD_SEP};

pub type NodeAttrs = HashMap<String, Value>;
pub type EdgeAttrs = HashMap<String, Value>;

/// All node and edge upserts collected while processing one document,
/// applied as a single transaction (spec.md §4.3).
#[derive(Debug, Default, Clone)]
pub struct GraphBatch {
    pub nodes: Vec<(String, NodeAttrs)>,
    pub edges: Vec<(String, String, EdgeAttrs)>,
}

/// Schema entry returned by [`GraphStore::community_schema`].
#[derive(Debug, Clone)]
pub struct CommunitySchemaEntry {
    pub level: u32,
    pub title: String,
    pub edges: Vec<(String, String)>,
    pub nodes: Vec<String>,
    pub sub_communities: Vec<u64>,
    pub occurrence: f64,
    pub chunk_ids: Vec<String>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn has_node(&self, id: &str) -> Result<bool>;
    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool>;

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>>;
    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeAttrs>>;

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeAttrs>>>;
    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeAttrs>>>;

    async fn node_degree(&self, id: &str) -> Result<usize>;
    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>>;

    /// Combined degree of both endpoints — the usual notion of "edge
    /// importance" used when ranking relationships for context assembly.
    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize>;
    async fn edge_degrees_batch(&self, pairs: &[(String, String)]) -> Result<Vec<usize>>;

    /// Outgoing edges from `id`, direction preserved. `None` if the node
    /// does not exist.
    async fn get_node_edges(&self, id: &str) -> Result<Option<Vec<(String, String)>>>;

    /// Merges `attrs` into the existing node (new keys win), matching the
    /// Neo4j backend's `SET n += data` semantics (spec.md §4.1.3).
    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()>;
    async fn upsert_edge(&self, src: &str, tgt: &str, attrs: EdgeAttrs) -> Result<()>;

    async fn upsert_nodes_batch(&self, nodes: Vec<(String, NodeAttrs)>) -> Result<()>;
    async fn upsert_edges_batch(&self, edges: Vec<(String, String, EdgeAttrs)>) -> Result<()>;

    /// Apply a whole document's node and edge upserts as one transaction.
    async fn execute_document_batch(&self, batch: GraphBatch) -> Result<()>;

    /// Mutate nodes in place to record `clusters` membership.
    async fn cluster(&self, max_cluster_size: usize, random_seed: u64) -> Result<()>;

    async fn community_schema(&self) -> Result<HashMap<String, CommunitySchemaEntry>>;

    async fn drop_all(&self) -> Result<()>;
    async fn index_done(&self) -> Result<()>;
}

/// Reference in-memory graph store backed by `petgraph`. Clustering uses
/// a simplified, fully deterministic stand-in for Leiden: connected
/// components at level 0, then recursive degree-ordered bisection of any
/// component larger than `max_cluster_size` to produce finer levels. It
/// optimizes for determinism and bounded cluster size, not modularity —
/// see DESIGN.md for the tradeoff.
#[derive(Default)]
pub struct InMemoryGraphStore {
    inner: RwLock<GraphInner>,
}

#[derive(Default)]
struct GraphInner {
    graph: DiGraph<String, EdgeAttrs>,
    index_of: HashMap<String, NodeIndex>,
    node_attrs: HashMap<String, NodeAttrs>,
}

impl GraphInner {
    fn ensure_node(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.index_of.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index_of.insert(id.to_string(), idx);
        self.node_attrs.insert(id.to_string(), NodeAttrs::new());
        idx
    }

    fn upsert_node(&mut self, id: &str, attrs: NodeAttrs) {
        self.ensure_node(id);
        self.node_attrs.entry(id.to_string()).or_default().extend(attrs);
    }

    fn upsert_edge(&mut self, src: &str, tgt: &str, attrs: EdgeAttrs) {
        let s = self.ensure_node(src);
        let t = self.ensure_node(tgt);
        if let Some(edge) = self.graph.find_edge(s, t) {
            self.graph[edge].extend(attrs);
        } else {
            self.graph.add_edge(s, t, attrs);
        }
    }

    fn degree(&self, id: &str) -> usize {
        match self.index_of.get(id) {
            Some(&idx) => self.graph.edges(idx).count() + self.graph.edges_directed(idx, petgraph::Direction::Incoming).count(),
            None => 0,
        }
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn has_node(&self, id: &str) -> Result<bool> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(inner.index_of.contains_key(id))
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(match (inner.index_of.get(src), inner.index_of.get(tgt)) {
            (Some(&s), Some(&t)) => inner.graph.find_edge(s, t).is_some(),
            _ => false,
        })
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(inner.node_attrs.get(id).cloned())
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeAttrs>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        let (s, t) = (inner.index_of.get(src).copied(), inner.index_of.get(tgt).copied());
        Ok(match (s, t) {
            (Some(s), Some(t)) => inner.graph.find_edge(s, t).map(|e| inner.graph[e].clone()),
            _ => None,
        })
    }

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeAttrs>>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(ids.iter().map(|id| inner.node_attrs.get(id).cloned()).collect())
    }

    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeAttrs>>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(pairs
            .iter()
            .map(|(src, tgt)| {
                let (s, t) = (inner.index_of.get(src).copied(), inner.index_of.get(tgt).copied());
                match (s, t) {
                    (Some(s), Some(t)) => inner.graph.find_edge(s, t).map(|e| inner.graph[e].clone()),
                    _ => None,
                }
            })
            .collect())
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(inner.degree(id))
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(ids.iter().map(|id| inner.degree(id)).collect())
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(inner.degree(src) + inner.degree(tgt))
    }

    async fn edge_degrees_batch(&self, pairs: &[(String, String)]) -> Result<Vec<usize>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        Ok(pairs.iter().map(|(src, tgt)| inner.degree(src) + inner.degree(tgt)).collect())
    }

    async fn get_node_edges(&self, id: &str) -> Result<Option<Vec<(String, String)>>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        let Some(&idx) = inner.index_of.get(id) else {
            return Ok(None);
        };
        let edges = inner
            .graph
            .edges(idx)
            .map(|e| (inner.graph[e.source()].clone(), inner.graph[e.target()].clone()))
            .collect();
        Ok(Some(edges))
    }

    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        inner.upsert_node(id, attrs);
        Ok(())
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, attrs: EdgeAttrs) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        inner.upsert_edge(src, tgt, attrs);
        Ok(())
    }

    async fn upsert_nodes_batch(&self, nodes: Vec<(String, NodeAttrs)>) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        for (id, attrs) in nodes {
            inner.upsert_node(&id, attrs);
        }
        Ok(())
    }

    async fn upsert_edges_batch(&self, edges: Vec<(String, String, EdgeAttrs)>) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        for (src, tgt, attrs) in edges {
            inner.upsert_edge(&src, &tgt, attrs);
        }
        Ok(())
    }

    async fn execute_document_batch(&self, batch: GraphBatch) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        for (id, attrs) in batch.nodes {
            inner.upsert_node(&id, attrs);
        }
        for (src, tgt, attrs) in batch.edges {
            inner.upsert_edge(&src, &tgt, attrs);
        }
        Ok(())
    }

    async fn cluster(&self, max_cluster_size: usize, random_seed: u64) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        let components = connected_components(&inner.graph);
        let mut assignments: HashMap<String, Vec<ClusterRef>> = HashMap::new();
        for (level0_id, members) in components.into_iter().enumerate() {
            let level0_id = level0_id as u64;
            for m in &members {
                assignments.entry(inner.graph[*m].clone()).or_default().push(ClusterRef { level: 0, cluster_id: level0_id });
            }
            if members.len() > max_cluster_size {
                let mut names: Vec<String> = members.iter().map(|m| inner.graph[*m].clone()).collect();
                names.sort_by_key(|n| stable_seed_key(n, random_seed));
                for (chunk_idx, chunk) in names.chunks(max_cluster_size).enumerate() {
                    let cluster_id = level0_id * 1_000 + chunk_idx as u64;
                    for name in chunk {
                        assignments.entry(name.clone()).or_default().push(ClusterRef { level: 1, cluster_id });
                    }
                }
            }
        }
        for (name, clusters) in assignments {
            inner
                .node_attrs
                .entry(name)
                .or_default()
                .insert("clusters".to_string(), serde_json::to_value(clusters).unwrap_or(Value::Null));
        }
        Ok(())
    }

    async fn community_schema(&self) -> Result<HashMap<String, CommunitySchemaEntry>> {
        let inner = self.inner.read().expect("graph store lock poisoned");
        let mut schema: HashMap<String, CommunitySchemaEntry> = HashMap::new();
        for (name, attrs) in &inner.node_attrs {
            let Some(clusters_value) = attrs.get("clusters") else { continue };
            let Ok(clusters) = serde_json::from_value::<Vec<ClusterRef>>(clusters_value.clone()) else { continue };
            for c in clusters {
                let key = format!("{}-{}", c.level, c.cluster_id);
                let entry = schema.entry(key).or_insert_with(|| CommunitySchemaEntry {
                    level: c.level,
                    title: format!("Community {}", c.cluster_id),
                    edges: Vec::new(),
                    nodes: Vec::new(),
                    sub_communities: Vec::new(),
                    occurrence: 0.0,
                    chunk_ids: Vec::new(),
                });
                entry.nodes.push(name.clone());
                if let Some(source_id) = attrs.get("source_id").and_then(|v| v.as_str()) {
                    entry.chunk_ids.extend(source_id.split(GRAPH_FIELD_SEP).filter(|s| !s.is_empty()).map(str::to_string));
                }
            }
        }
        for entry in schema.values_mut() {
            for node in &entry.nodes {
                if let Some(&idx) = inner.index_of.get(node) {
                    for e in inner.graph.edges(idx) {
                        entry.edges.push((inner.graph[e.source()].clone(), inner.graph[e.target()].clone()));
                    }
                }
            }
            entry.occurrence = entry.nodes.len() as f64;
            entry.chunk_ids.sort();
            entry.chunk_ids.dedup();
        }

        // `cluster()` encodes a level-1 cluster's parent as
        // `cluster_id / 1_000 == level0_id` — recover that linkage here
        // rather than threading it through as separate state.
        let level1_ids: Vec<u64> = schema
            .keys()
            .filter_map(|key| {
                let (level, cluster_id) = key.split_once('-')?;
                (level == "1").then(|| cluster_id.parse::<u64>().ok()).flatten()
            })
            .collect();
        for cluster_id in level1_ids {
            let parent_key = format!("0-{}", cluster_id / 1_000);
            if let Some(parent) = schema.get_mut(&parent_key) {
                parent.sub_communities.push(cluster_id);
            }
        }
        for entry in schema.values_mut() {
            entry.sub_communities.sort();
            entry.sub_communities.dedup();
        }
        Ok(schema)
    }

    async fn drop_all(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("graph store lock poisoned");
        *inner = GraphInner::default();
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}

fn stable_seed_key(name: &str, seed: u64) -> u64 {
    crate::ids::stable_point_id(&seed.to_string(), name)
}

fn connected_components(graph: &DiGraph<String, EdgeAttrs>) -> Vec<Vec<NodeIndex>> {
    let mut visited = vec![false; graph.node_count()];
    let mut components = Vec::new();
    for start in graph.node_indices() {
        if visited[start.index()] {
            continue;
        }
        let mut stack = vec![start];
        let mut members = Vec::new();
        visited[start.index()] = true;
        while let Some(node) = stack.pop() {
            members.push(node);
            for neighbor in graph.neighbors_undirected(node) {
                if !visited[neighbor.index()] {
                    visited[neighbor.index()] = true;
                    stack.push(neighbor);
                }
            }
        }
        components.push(members);
    }
    components
}
