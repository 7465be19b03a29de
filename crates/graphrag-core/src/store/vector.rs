//! Vector storage contract (spec.md §4.1.2).
//!
//! `content` is the canonical embedding source and is fixed at first
//! insert: re-upserting an existing ID preserves the original vector
//! unless the caller explicitly re-embeds by dropping and re-inserting.
//! `update_payload` can touch everything except `content` and the vector
//! itself (spec.md §3 Ownership, §5 Shared resource policy).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::embedding::cosine_similarity;
use crate::error::{GraphRagError, Result};
use crate::ids::stable_point_id;

/// One stored point: the embedding, its canonical text, and opaque payload.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub extra_payload: HashMap<String, Value>,
}

/// A scored search result.
#[derive(Debug, Clone)]
pub struct VectorSearchHit {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub extra_payload: HashMap<String, Value>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert new points or update existing ones. For an ID that already
    /// exists, `content`/`embedding` are ignored — only `extra_payload` is
    /// merged in (spec.md §4.1.2 Contract).
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()>;

    /// Embed `query_vec` is supplied by the caller (the orchestration
    /// layer owns the embedding call); this performs the similarity scan.
    async fn query(&self, ns: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>>;

    /// Like [`query`](Self::query), but also hands the backend the raw
    /// query text. Backends with a hybrid dense+sparse capability (spec.md
    /// §4.1.2) can sparse-encode `query_text` and fuse it with the dense
    /// scan; the default just ignores it and delegates to `query`.
    async fn query_with_text(&self, ns: &str, _query_text: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        self.query(ns, query_vec, top_k).await
    }

    /// Update payload fields only. MUST reject `content` and `embedding`
    /// keys with a `ContractViolation`.
    async fn update_payload(&self, ns: &str, id: &str, partial_payload: HashMap<String, Value>) -> Result<()>;

    async fn drop_namespace(&self, ns: &str) -> Result<()>;

    async fn index_done(&self) -> Result<()>;
}

/// Reference brute-force cosine-similarity vector store (spec.md's
/// "nano-vector" backend). Good up to a modest corpus size; the `graphrag`
/// app crate adds an HNSW-backed variant and the Qdrant backend for scale.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    data: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

const PROTECTED_PAYLOAD_KEYS: [&str; 2] = ["content", "embedding"];

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut data = self.data.write().expect("vector store lock poisoned");
        let ns_map = data.entry(ns.to_string()).or_default();
        for record in records {
            // Derive the stable point id once; reference impl keys by the
            // caller id directly since there is no external point-id space
            // to hash into here (see `stable_point_id` for backends that need it).
            let _point_id = stable_point_id(ns, &record.id);
            match ns_map.get_mut(&record.id) {
                Some(existing) => {
                    existing.extra_payload.extend(record.extra_payload);
                }
                None => {
                    ns_map.insert(record.id.clone(), record);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, ns: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        let data = self.data.read().expect("vector store lock poisoned");
        let Some(ns_map) = data.get(ns) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<VectorSearchHit> = ns_map
            .values()
            .map(|record| VectorSearchHit {
                id: record.id.clone(),
                score: cosine_similarity(query_vec, &record.embedding),
                content: record.content.clone(),
                extra_payload: record.extra_payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn update_payload(&self, ns: &str, id: &str, partial_payload: HashMap<String, Value>) -> Result<()> {
        if let Some(key) = partial_payload.keys().find(|k| PROTECTED_PAYLOAD_KEYS.contains(&k.as_str())) {
            return Err(GraphRagError::contract(format!(
                "update_payload must not touch protected field '{key}'"
            )));
        }
        let mut data = self.data.write().expect("vector store lock poisoned");
        if let Some(record) = data.get_mut(ns).and_then(|m| m.get_mut(id)) {
            record.extra_payload.extend(partial_payload);
        }
        Ok(())
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        let mut data = self.data.write().expect("vector store lock poisoned");
        data.remove(ns);
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}
