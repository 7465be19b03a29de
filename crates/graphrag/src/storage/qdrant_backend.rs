//! Qdrant vector backend (`storage.vector_backend = "qdrant"`, spec.md
//! §4.1.2). One collection per namespace; point IDs are deterministic —
//! derived by `xxhash64`-ing `{ns}::{id}` (distinct from the in-memory
//! backend's FNV-1a `stable_point_id`, see DESIGN.md). Collections are
//! created lazily on first upsert so importing this module never pays
//! for a collection the caller never populates (spec.md §9).
//!
//! Hybrid search (dense + sparse, fused by Reciprocal Rank Fusion) is
//! attempted when `hybrid_search.enabled`. Collections created under hybrid
//! mode hold two named vectors per point, `dense` and `sparse` (spec.md
//! §4.1.2), and `query_with_text` runs a dense nearest-neighbor search and a
//! sparse nearest-neighbor search in parallel and fuses the two rankings
//! client-side with the configured `rrf_k` — this crate has no SPLADE-style
//! model to produce the sparse vectors, so `encode_sparse` is a simplified,
//! deterministic hashed-bag-of-words stand-in (see its doc comment); any
//! sparse-encoding failure (an empty query) falls back to dense-only with a
//! WARN log (spec.md §4.1.2, Scenario E).

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::RwLock;

use async_trait::async_trait;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::store::{VectorRecord, VectorSearchHit, VectorStore};
use qdrant_client::qdrant::{
    point_id::PointIdOptions, CreateCollectionBuilder, Distance, PointId, PointStruct, Query, QueryPointsBuilder, SearchPointsBuilder,
    SparseVectorParamsBuilder, SparseVectorsConfigBuilder, UpsertPointsBuilder, Value as QdrantValue, Vector, VectorParamsBuilder, VectorParamsMapBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use twox_hash::XxHash64;

use crate::config::{HybridSearchConfig, QdrantBackendConfig};

const DENSE_VECTOR_NAME: &str = "dense";
const SPARSE_VECTOR_NAME: &str = "sparse";

fn deterministic_point_id(ns: &str, id: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(ns.as_bytes());
    hasher.write(b"::");
    hasher.write(id.as_bytes());
    hasher.finish()
}

/// Reciprocal-rank-fuse two already-ranked hit lists (lowest rank = best
/// match), using `k` the way spec.md §4.1.2 describes: `score = sum over
/// lists containing the id of 1 / (k + rank + 1)`. An id present in only
/// one list is scored from that list alone.
fn reciprocal_rank_fuse(lists: &[Vec<VectorSearchHit>], k: u32, top_k: usize) -> Vec<VectorSearchHit> {
    let mut by_id: HashMap<String, VectorSearchHit> = HashMap::new();
    let mut fused_score: HashMap<String, f64> = HashMap::new();
    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            *fused_score.entry(hit.id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
            by_id.entry(hit.id.clone()).or_insert_with(|| hit.clone());
        }
    }
    let mut ranked: Vec<(String, f64)> = fused_score.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .into_iter()
        .take(top_k)
        .filter_map(|(id, score)| {
            by_id.remove(&id).map(|mut hit| {
                hit.score = score as f32;
                hit
            })
        })
        .collect()
}

fn json_to_qdrant(value: &Value) -> QdrantValue {
    match value {
        Value::Null => QdrantValue::from(Option::<bool>::None),
        Value::Bool(b) => QdrantValue::from(*b),
        Value::Number(n) => n.as_f64().map(QdrantValue::from).unwrap_or_else(|| QdrantValue::from(n.to_string())),
        Value::String(s) => QdrantValue::from(s.clone()),
        other => QdrantValue::from(other.to_string()),
    }
}

fn qdrant_payload(content: &str, extra: &HashMap<String, Value>) -> HashMap<String, QdrantValue> {
    let mut payload: HashMap<String, QdrantValue> = extra.iter().map(|(k, v)| (k.clone(), json_to_qdrant(v))).collect();
    payload.insert("content".to_string(), QdrantValue::from(content));
    payload
}

pub struct QdrantVectorStore {
    client: Qdrant,
    hybrid: HybridSearchConfig,
    known_collections: RwLock<std::collections::HashSet<String>>,
}

impl QdrantVectorStore {
    pub async fn connect(config: &QdrantBackendConfig, hybrid: &HybridSearchConfig) -> anyhow::Result<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, hybrid: hybrid.clone(), known_collections: RwLock::new(std::collections::HashSet::new()) })
    }

    async fn ensure_collection(&self, ns: &str, dims: usize) -> Result<()> {
        if self.known_collections.read().expect("lock poisoned").contains(ns) {
            return Ok(());
        }
        let exists = self.client.collection_exists(ns).await.map_err(|e| GraphRagError::transient_from("qdrant collection_exists failed", e.into()))?;
        if !exists {
            let mut builder = CreateCollectionBuilder::new(ns);
            if self.hybrid.enabled {
                // Two named vectors per point (spec.md §4.1.2): `dense` for the
                // embedding, `sparse` for the hashed-bag-of-words stand-in.
                builder = builder
                    .vectors_config(VectorParamsMapBuilder::default().add_named_vector_params(DENSE_VECTOR_NAME, VectorParamsBuilder::new(dims as u64, Distance::Cosine)))
                    .sparse_vectors_config(SparseVectorsConfigBuilder::default().add_named_vector_params(SPARSE_VECTOR_NAME, SparseVectorParamsBuilder::default()));
            } else {
                builder = builder.vectors_config(VectorParamsBuilder::new(dims as u64, Distance::Cosine));
            }
            self.client.create_collection(builder).await.map_err(|e| GraphRagError::transient_from("qdrant create_collection failed", e.into()))?;
        }
        self.known_collections.write().expect("lock poisoned").insert(ns.to_string());
        Ok(())
    }

    /// Sparse-encoder hook. No real SPLADE-style model ships with this
    /// crate (one would be selected here by `hybrid.sparse_model`, cached
    /// process-wide, and run on `hybrid.device`); this is a simplified,
    /// fully deterministic stand-in — a hashed bag-of-words term-frequency
    /// vector — that still exercises the real dense+sparse fusion path
    /// rather than disabling it outright. Fails only on text with no
    /// tokens, which is the degrade path spec.md Scenario E describes.
    fn encode_sparse(&self, text: &str) -> std::result::Result<Vec<(u32, f32)>, ()> {
        let mut counts: HashMap<u32, f32> = HashMap::new();
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut hasher = XxHash64::with_seed(0x5BD1_E995);
            hasher.write(token.to_lowercase().as_bytes());
            let index = (hasher.finish() % u32::MAX as u64) as u32;
            *counts.entry(index).or_insert(0.0) += 1.0;
        }
        if counts.is_empty() {
            return Err(());
        }
        let mut sparse: Vec<(u32, f32)> = counts.into_iter().collect();
        sparse.sort_by_key(|(idx, _)| *idx);
        Ok(sparse)
    }

    async fn hybrid_search(&self, ns: &str, query_text: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        let Ok(sparse) = self.encode_sparse(query_text) else {
            tracing::warn!(target: "graphrag::storage", namespace = ns, "sparse encoder unavailable for this query, falling back to dense-only search");
            return self.dense_search(ns, query_vec, top_k).await;
        };

        let dense_limit = ((top_k as f64) * self.hybrid.dense_top_k_multiplier).ceil().max(top_k as f64) as u64;
        let sparse_limit = ((top_k as f64) * self.hybrid.sparse_top_k_multiplier).ceil().max(top_k as f64) as u64;
        let (sparse_indices, sparse_values): (Vec<u32>, Vec<f32>) = sparse.into_iter().unzip();
        let budget = std::time::Duration::from_secs_f64(self.hybrid.timeout_seconds.max(0.0));

        let dense_future = self.client.query(
            QueryPointsBuilder::new(ns)
                .query(Query::new_nearest(query_vec.to_vec()))
                .using(DENSE_VECTOR_NAME)
                .limit(dense_limit)
                .with_payload(true),
        );
        let sparse_future = self.client.query(
            QueryPointsBuilder::new(ns)
                .query(Query::new_nearest((sparse_indices, sparse_values)))
                .using(SPARSE_VECTOR_NAME)
                .limit(sparse_limit)
                .with_payload(true),
        );

        let Ok(sparse_result) = tokio::time::timeout(budget, sparse_future).await else {
            tracing::warn!(target: "graphrag::storage", namespace = ns, timeout_seconds = self.hybrid.timeout_seconds, "sparse query timed out, falling back to dense-only search");
            return self.dense_search(ns, query_vec, top_k).await;
        };
        let sparse_query = sparse_result.map_err(|e| GraphRagError::transient_from("qdrant sparse query failed", e.into()))?;
        let dense_query = dense_future.await.map_err(|e| GraphRagError::transient_from("qdrant dense query failed", e.into()))?;

        let dense_hits: Vec<VectorSearchHit> = dense_query.result.into_iter().map(scored_point_to_hit).collect();
        let sparse_hits: Vec<VectorSearchHit> = sparse_query.result.into_iter().map(scored_point_to_hit).collect();
        Ok(reciprocal_rank_fuse(&[dense_hits, sparse_hits], self.hybrid.rrf_k, top_k))
    }

    async fn dense_search(&self, ns: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        let response = self
            .client
            .search_points(SearchPointsBuilder::new(ns, query_vec.to_vec(), top_k as u64).with_payload(true))
            .await
            .map_err(|e| GraphRagError::transient_from("qdrant search failed", e.into()))?;
        Ok(response.result.into_iter().map(scored_point_to_hit).collect())
    }
}

fn scored_point_to_hit(scored: qdrant_client::qdrant::ScoredPoint) -> VectorSearchHit {
    let id = match scored.id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };
    let payload: HashMap<String, Value> = scored.payload.iter().filter(|(k, _)| k.as_str() != "content").map(|(k, v)| (k.clone(), qdrant_value_to_json(v))).collect();
    let content = scored.payload.get("content").map(qdrant_value_to_json).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
    VectorSearchHit { id, score: scored.score, content, extra_payload: payload }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()> {
        let Some(dims) = records.first().map(|r| r.embedding.len()) else {
            return Ok(());
        };
        self.ensure_collection(ns, dims).await?;
        let points: Vec<PointStruct> = records
            .iter()
            .map(|r| {
                let point_id = deterministic_point_id(ns, &r.id);
                if self.hybrid.enabled {
                    let sparse = self.encode_sparse(&r.content).unwrap_or_default();
                    let (indices, values): (Vec<u32>, Vec<f32>) = sparse.into_iter().unzip();
                    let vectors: HashMap<String, Vector> = HashMap::from([(DENSE_VECTOR_NAME.to_string(), Vector::from(r.embedding.clone())), (SPARSE_VECTOR_NAME.to_string(), Vector::from((indices, values)))]);
                    PointStruct::new(point_id, vectors, qdrant_payload(&r.content, &r.extra_payload))
                } else {
                    PointStruct::new(point_id, r.embedding.clone(), qdrant_payload(&r.content, &r.extra_payload))
                }
            })
            .collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(ns, points))
            .await
            .map_err(|e| GraphRagError::transient_from("qdrant upsert failed", e.into()))?;
        Ok(())
    }

    async fn query(&self, ns: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        self.dense_search(ns, query_vec, top_k).await
    }

    async fn query_with_text(&self, ns: &str, query_text: &str, query_vec: &[f32], top_k: usize) -> Result<Vec<VectorSearchHit>> {
        if !self.hybrid.enabled {
            return self.dense_search(ns, query_vec, top_k).await;
        }
        self.hybrid_search(ns, query_text, query_vec, top_k).await
    }

    async fn update_payload(&self, ns: &str, id: &str, partial_payload: HashMap<String, Value>) -> Result<()> {
        const PROTECTED: [&str; 2] = ["content", "embedding"];
        if let Some(key) = partial_payload.keys().find(|k| PROTECTED.contains(&k.as_str())) {
            return Err(GraphRagError::contract(format!("update_payload must not touch protected field '{key}'")));
        }
        let point_id: PointId = deterministic_point_id(ns, id).into();
        let payload: HashMap<String, QdrantValue> = partial_payload.iter().map(|(k, v)| (k.clone(), json_to_qdrant(v))).collect();
        self.client
            .set_payload(qdrant_client::qdrant::SetPayloadPointsBuilder::new(ns, payload).points([point_id]))
            .await
            .map_err(|e| GraphRagError::transient_from("qdrant set_payload failed", e.into()))?;
        Ok(())
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        self.known_collections.write().expect("lock poisoned").remove(ns);
        self.client.delete_collection(ns).await.map_err(|e| GraphRagError::transient_from("qdrant delete_collection failed", e.into()))?;
        Ok(())
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}

fn qdrant_value_to_json(value: &QdrantValue) -> Value {
    serde_json::to_value(format!("{value:?}")).unwrap_or(Value::Null)
}
