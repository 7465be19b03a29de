//! File-based backends: the default `json`/`nano`/`networkx` tokens
//! (spec.md §4.1, §6 "Persisted state layout"). Each wraps the
//! dependency-light in-memory reference implementation from
//! `graphrag-core` for its actual read/write logic and adds a thin
//! load-on-construct / flush-on-`index_done` layer around it, offloading
//! blocking file I/O to a worker thread (spec.md §5 "Suspension points").

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::store::graph::{CommunitySchemaEntry, EdgeAttrs, GraphBatch, NodeAttrs};
use graphrag_core::store::{GraphStore, InMemoryGraphStore, InMemoryVectorStore, KvStore, VectorRecord, VectorSearchHit, VectorStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

fn to_internal(err: std::io::Error) -> GraphRagError {
    GraphRagError::Internal(format!("file backend I/O error: {err}"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> std::io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content).ok())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value).unwrap_or_default();
    std::fs::write(path, content)
}

/// File-backed KV store: one JSON file per namespace, full-read on first
/// touch, full-write on `index_done` (spec.md §4.1.1 "File-based JSON").
pub struct FileKvStore {
    working_dir: PathBuf,
    data: RwLock<HashMap<String, HashMap<String, Value>>>,
    loaded: RwLock<HashSet<String>>,
}

impl FileKvStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self { working_dir: working_dir.into(), data: RwLock::new(HashMap::new()), loaded: RwLock::new(HashSet::new()) }
    }

    fn path_for(&self, ns: &str) -> PathBuf {
        self.working_dir.join(format!("kv_store_{ns}.json"))
    }

    async fn ensure_loaded(&self, ns: &str) -> Result<()> {
        if self.loaded.read().expect("lock poisoned").contains(ns) {
            return Ok(());
        }
        let path = self.path_for(ns);
        let loaded: Option<HashMap<String, Value>> = tokio::task::spawn_blocking(move || read_json(&path))
            .await
            .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
            .map_err(to_internal)?;
        let mut data = self.data.write().expect("lock poisoned");
        data.entry(ns.to_string()).or_default().extend(loaded.unwrap_or_default());
        self.loaded.write().expect("lock poisoned").insert(ns.to_string());
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        self.ensure_loaded(ns).await?;
        let data = self.data.read().expect("lock poisoned");
        Ok(data.get(ns).and_then(|m| m.get(id)).cloned())
    }

    async fn get_many(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        self.ensure_loaded(ns).await?;
        let data = self.data.read().expect("lock poisoned");
        let ns_map = data.get(ns);
        Ok(ids.iter().map(|id| ns_map.and_then(|m| m.get(id)).cloned()).collect())
    }

    async fn upsert(&self, ns: &str, values: HashMap<String, Value>) -> Result<()> {
        self.ensure_loaded(ns).await?;
        let mut data = self.data.write().expect("lock poisoned");
        data.entry(ns.to_string()).or_default().extend(values);
        Ok(())
    }

    async fn delete(&self, ns: &str, id: &str) -> Result<bool> {
        self.ensure_loaded(ns).await?;
        let mut data = self.data.write().expect("lock poisoned");
        Ok(data.get_mut(ns).map(|m| m.remove(id).is_some()).unwrap_or(false))
    }

    async fn all_keys(&self, ns: &str) -> Result<HashSet<String>> {
        self.ensure_loaded(ns).await?;
        let data = self.data.read().expect("lock poisoned");
        Ok(data.get(ns).map(|m| m.keys().cloned().collect()).unwrap_or_default())
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        self.loaded.write().expect("lock poisoned").insert(ns.to_string());
        self.data.write().expect("lock poisoned").remove(ns);
        let path = self.path_for(ns);
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_file(path)).await;
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        let snapshot: Vec<(String, HashMap<String, Value>)> = self.data.read().expect("lock poisoned").clone().into_iter().collect();
        let working_dir = self.working_dir.clone();
        tokio::task::spawn_blocking(move || {
            for (ns, values) in snapshot {
                let path = working_dir.join(format!("kv_store_{ns}.json"));
                write_json(&path, &values)?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
        .map_err(to_internal)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredVectorRecord {
    content: String,
    embedding: Vec<f32>,
    extra_payload: HashMap<String, Value>,
}

/// File-backed vector store. The similarity scan and the payload-only
/// update contract are delegated to [`InMemoryVectorStore`]; this wrapper
/// only shadows the full records (including embeddings, which the
/// `VectorStore` trait never hands back out) so they can be flushed to
/// `vdb_<ns>.json` on `index_done` and reloaded at startup.
pub struct FileVectorStore {
    working_dir: PathBuf,
    inner: InMemoryVectorStore,
    shadow: RwLock<HashMap<String, HashMap<String, StoredVectorRecord>>>,
    loaded: RwLock<HashSet<String>>,
}

impl FileVectorStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            inner: InMemoryVectorStore::new(),
            shadow: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashSet::new()),
        }
    }

    fn path_for(&self, ns: &str) -> PathBuf {
        self.working_dir.join(format!("vdb_{ns}.json"))
    }

    async fn ensure_loaded(&self, ns: &str) -> Result<()> {
        if self.loaded.read().expect("lock poisoned").contains(ns) {
            return Ok(());
        }
        let path = self.path_for(ns);
        let loaded: Option<HashMap<String, StoredVectorRecord>> = tokio::task::spawn_blocking(move || read_json(&path))
            .await
            .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
            .map_err(to_internal)?;
        if let Some(records) = loaded {
            let to_rehydrate: Vec<VectorRecord> = records
                .iter()
                .map(|(id, r)| VectorRecord { id: id.clone(), content: r.content.clone(), embedding: r.embedding.clone(), extra_payload: r.extra_payload.clone() })
                .collect();
            self.inner.upsert(ns, to_rehydrate).await?;
            self.shadow.write().expect("lock poisoned").insert(ns.to_string(), records);
        }
        self.loaded.write().expect("lock poisoned").insert(ns.to_string());
        Ok(())
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()> {
        self.ensure_loaded(ns).await?;
        let mut shadow = self.shadow.write().expect("lock poisoned");
        let ns_shadow = shadow.entry(ns.to_string()).or_default();
        for record in &records {
            match ns_shadow.get_mut(&record.id) {
                Some(existing) => existing.extra_payload.extend(record.extra_payload.clone()),
                None => {
                    ns_shadow.insert(
                        record.id.clone(),
                        StoredVectorRecord { content: record.content.clone(), embedding: record.embedding.clone(), extra_payload: record.extra_payload.clone() },
                    );
                }
            }
        }
        drop(shadow);
        self.inner.upsert(ns, records).await
    }

    async fn query(&self, ns: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        self.ensure_loaded(ns).await?;
        self.inner.query(ns, query_vec, top_k).await
    }

    async fn update_payload(&self, ns: &str, id: &str, partial_payload: HashMap<String, Value>) -> Result<()> {
        self.ensure_loaded(ns).await?;
        if let Some(record) = self.shadow.write().expect("lock poisoned").get_mut(ns).and_then(|m| m.get_mut(id)) {
            record.extra_payload.extend(partial_payload.clone());
        }
        self.inner.update_payload(ns, id, partial_payload).await
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        self.loaded.write().expect("lock poisoned").insert(ns.to_string());
        self.shadow.write().expect("lock poisoned").remove(ns);
        self.inner.drop_namespace(ns).await?;
        let path = self.path_for(ns);
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_file(path)).await;
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        let snapshot: Vec<(String, HashMap<String, StoredVectorRecord>)> =
            self.shadow.read().expect("lock poisoned").iter().map(|(ns, m)| (ns.clone(), clone_records(m))).collect();
        let working_dir = self.working_dir.clone();
        tokio::task::spawn_blocking(move || {
            for (ns, records) in snapshot {
                let path = working_dir.join(format!("vdb_{ns}.json"));
                write_json(&path, &records)?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
        .map_err(to_internal)
    }
}

fn clone_records(m: &HashMap<String, StoredVectorRecord>) -> HashMap<String, StoredVectorRecord> {
    m.iter().map(|(k, v)| (k.clone(), StoredVectorRecord { content: v.content.clone(), embedding: v.embedding.clone(), extra_payload: v.extra_payload.clone() })).collect()
}

#[derive(Serialize, Deserialize, Default)]
struct GraphSnapshot {
    nodes: Vec<(String, NodeAttrs)>,
    edges: Vec<(String, String, EdgeAttrs)>,
}

/// File-backed graph store: delegates all graph logic (including
/// clustering) to [`InMemoryGraphStore`], and shadows the set of known
/// node ids / edge pairs purely to be able to reconstruct a full
/// snapshot for `graph_chunk_entity_relation.json` on `index_done`.
pub struct FileGraphStore {
    working_dir: PathBuf,
    inner: InMemoryGraphStore,
    node_ids: RwLock<HashSet<String>>,
    edge_pairs: RwLock<HashSet<(String, String)>>,
    loaded: RwLock<bool>,
}

impl FileGraphStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            inner: InMemoryGraphStore::new(),
            node_ids: RwLock::new(HashSet::new()),
            edge_pairs: RwLock::new(HashSet::new()),
            loaded: RwLock::new(false),
        }
    }

    fn path(&self) -> PathBuf {
        self.working_dir.join("graph_chunk_entity_relation.json")
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if *self.loaded.read().expect("lock poisoned") {
            return Ok(());
        }
        let path = self.path();
        let snapshot: Option<GraphSnapshot> = tokio::task::spawn_blocking(move || read_json(&path))
            .await
            .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
            .map_err(to_internal)?;
        if let Some(snapshot) = snapshot {
            {
                let mut ids = self.node_ids.write().expect("lock poisoned");
                ids.extend(snapshot.nodes.iter().map(|(id, _)| id.clone()));
            }
            {
                let mut pairs = self.edge_pairs.write().expect("lock poisoned");
                pairs.extend(snapshot.edges.iter().map(|(s, t, _)| (s.clone(), t.clone())));
            }
            self.inner.execute_document_batch(GraphBatch { nodes: snapshot.nodes, edges: snapshot.edges }).await?;
        }
        *self.loaded.write().expect("lock poisoned") = true;
        Ok(())
    }

    fn track_node(&self, id: &str) {
        self.node_ids.write().expect("lock poisoned").insert(id.to_string());
    }

    fn track_edge(&self, src: &str, tgt: &str) {
        self.edge_pairs.write().expect("lock poisoned").insert((src.to_string(), tgt.to_string()));
    }
}

#[async_trait]
impl GraphStore for FileGraphStore {
    async fn has_node(&self, id: &str) -> Result<bool> {
        self.ensure_loaded().await?;
        self.inner.has_node(id).await
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        self.ensure_loaded().await?;
        self.inner.has_edge(src, tgt).await
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>> {
        self.ensure_loaded().await?;
        self.inner.get_node(id).await
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeAttrs>> {
        self.ensure_loaded().await?;
        self.inner.get_edge(src, tgt).await
    }

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeAttrs>>> {
        self.ensure_loaded().await?;
        self.inner.get_nodes_batch(ids).await
    }

    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeAttrs>>> {
        self.ensure_loaded().await?;
        self.inner.get_edges_batch(pairs).await
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        self.ensure_loaded().await?;
        self.inner.node_degree(id).await
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>> {
        self.ensure_loaded().await?;
        self.inner.node_degrees_batch(ids).await
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        self.ensure_loaded().await?;
        self.inner.edge_degree(src, tgt).await
    }

    async fn edge_degrees_batch(&self, pairs: &[(String, String)]) -> Result<Vec<usize>> {
        self.ensure_loaded().await?;
        self.inner.edge_degrees_batch(pairs).await
    }

    async fn get_node_edges(&self, id: &str) -> Result<Option<Vec<(String, String)>>> {
        self.ensure_loaded().await?;
        self.inner.get_node_edges(id).await
    }

    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()> {
        self.ensure_loaded().await?;
        self.track_node(id);
        self.inner.upsert_node(id, attrs).await
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, attrs: EdgeAttrs) -> Result<()> {
        self.ensure_loaded().await?;
        self.track_node(src);
        self.track_node(tgt);
        self.track_edge(src, tgt);
        self.inner.upsert_edge(src, tgt, attrs).await
    }

    async fn upsert_nodes_batch(&self, nodes: Vec<(String, NodeAttrs)>) -> Result<()> {
        self.ensure_loaded().await?;
        for (id, _) in &nodes {
            self.track_node(id);
        }
        self.inner.upsert_nodes_batch(nodes).await
    }

    async fn upsert_edges_batch(&self, edges: Vec<(String, String, EdgeAttrs)>) -> Result<()> {
        self.ensure_loaded().await?;
        for (src, tgt, _) in &edges {
            self.track_node(src);
            self.track_node(tgt);
            self.track_edge(src, tgt);
        }
        self.inner.upsert_edges_batch(edges).await
    }

    async fn execute_document_batch(&self, batch: GraphBatch) -> Result<()> {
        self.ensure_loaded().await?;
        for (id, _) in &batch.nodes {
            self.track_node(id);
        }
        for (src, tgt, _) in &batch.edges {
            self.track_node(src);
            self.track_node(tgt);
            self.track_edge(src, tgt);
        }
        self.inner.execute_document_batch(batch).await
    }

    async fn cluster(&self, max_cluster_size: usize, random_seed: u64) -> Result<()> {
        self.ensure_loaded().await?;
        self.inner.cluster(max_cluster_size, random_seed).await
    }

    async fn community_schema(&self) -> Result<HashMap<String, CommunitySchemaEntry>> {
        self.ensure_loaded().await?;
        self.inner.community_schema().await
    }

    async fn drop_all(&self) -> Result<()> {
        self.node_ids.write().expect("lock poisoned").clear();
        self.edge_pairs.write().expect("lock poisoned").clear();
        self.inner.drop_all().await?;
        let path = self.path();
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_file(path)).await;
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        let ids: Vec<String> = self.node_ids.read().expect("lock poisoned").iter().cloned().collect();
        let pairs: Vec<(String, String)> = self.edge_pairs.read().expect("lock poisoned").iter().cloned().collect();
        let node_attrs = self.inner.get_nodes_batch(&ids).await?;
        let edge_attrs = self.inner.get_edges_batch(&pairs).await?;
        let nodes: Vec<(String, NodeAttrs)> = ids.into_iter().zip(node_attrs).filter_map(|(id, attrs)| attrs.map(|a| (id, a))).collect();
        let edges: Vec<(String, String, EdgeAttrs)> = pairs
            .into_iter()
            .zip(edge_attrs)
            .filter_map(|((s, t), attrs)| attrs.map(|a| (s, t, a)))
            .collect();
        if nodes.is_empty() && edges.is_empty() {
            warn!(target: "graphrag::storage", "flushing an empty graph snapshot");
        }
        let snapshot = GraphSnapshot { nodes, edges };
        let path = self.path();
        tokio::task::spawn_blocking(move || write_json(&path, &snapshot))
            .await
            .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
            .map_err(to_internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_store_survives_a_flush_and_reload_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        store.upsert("docs", HashMap::from([("doc-1".to_string(), serde_json::json!("hello"))])).await.unwrap();
        store.index_done().await.unwrap();

        let reloaded = FileKvStore::new(dir.path());
        assert_eq!(reloaded.get("docs", "doc-1").await.unwrap(), Some(serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn kv_store_drop_namespace_removes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        store.upsert("docs", HashMap::from([("doc-1".to_string(), serde_json::json!("hello"))])).await.unwrap();
        store.index_done().await.unwrap();
        store.drop_namespace("docs").await.unwrap();

        let reloaded = FileKvStore::new(dir.path());
        assert!(reloaded.get("docs", "doc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vector_store_reload_preserves_embedding_after_payload_only_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path());
        store
            .upsert("entities", vec![VectorRecord { id: "ALICE".to_string(), content: "Alice".to_string(), embedding: vec![1.0, 0.0], extra_payload: HashMap::new() }])
            .await
            .unwrap();
        store.update_payload("entities", "ALICE", HashMap::from([("community_description".to_string(), serde_json::json!("new text"))])).await.unwrap();
        store.index_done().await.unwrap();

        let reloaded = FileVectorStore::new(dir.path());
        let hits = reloaded.query("entities", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Alice");
        assert_eq!(hits[0].extra_payload.get("community_description"), Some(&serde_json::json!("new text")));
    }

    #[tokio::test]
    async fn graph_store_survives_a_flush_and_reload_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGraphStore::new(dir.path());
        store.upsert_node("ALICE", NodeAttrs::from([("entity_type".to_string(), serde_json::json!("PERSON"))])).await.unwrap();
        store.upsert_node("ACME", NodeAttrs::from([("entity_type".to_string(), serde_json::json!("ORGANIZATION"))])).await.unwrap();
        store.upsert_edge("ALICE", "ACME", EdgeAttrs::from([("relation_type".to_string(), serde_json::json!("EMPLOYED_BY"))])).await.unwrap();
        store.index_done().await.unwrap();

        let reloaded = FileGraphStore::new(dir.path());
        assert!(reloaded.has_edge("ALICE", "ACME").await.unwrap());
        assert!(!reloaded.has_edge("ACME", "ALICE").await.unwrap());
    }

    #[tokio::test]
    async fn graph_store_drop_all_removes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGraphStore::new(dir.path());
        store.upsert_node("ALICE", NodeAttrs::from([("entity_type".to_string(), serde_json::json!("PERSON"))])).await.unwrap();
        store.index_done().await.unwrap();
        store.drop_all().await.unwrap();

        let reloaded = FileGraphStore::new(dir.path());
        assert!(!reloaded.has_node("ALICE").await.unwrap());
    }
}
