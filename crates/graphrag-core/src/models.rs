//! Core data model (spec.md §3).
//!
//! These types flow through the whole pipeline: a [`Document`] is split
//! into [`Chunk`]s, chunks are extracted into [`Entity`]/[`Relationship`]
//! records, entities are clustered into [`Community`]s, and communities are
//! summarized into a [`CommunityReport`]. [`Job`] tracks one async ingest
//! call end to end.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator used to join a provenance set (chunk IDs) into a single
/// string field, and to join concatenated descriptions (spec.md §3, §6).
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

/// An immutable ingested document, identified by `doc-<hash-of-content>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A contiguous, token-bounded, document-scoped span of a [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub full_doc_id: String,
    pub chunk_order_index: i64,
    pub tokens: usize,
    pub content: String,
}

/// A graph node: a typed entity merged from one or more extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical ID: uppercased, quote-stripped name (see [`crate::ids::canonical_entity_id`]).
    pub name: String,
    pub entity_type: String,
    pub description: String,
    /// Serialized as a `GRAPH_FIELD_SEP`-joined string when persisted;
    /// kept as a set here so merges can be written total and testable.
    pub source_ids: BTreeSet<String>,
    /// Hierarchical community membership, coarsest (level 0) first.
    #[serde(default)]
    pub clusters: Vec<ClusterRef>,
    #[serde(default)]
    pub has_vector: bool,
}

impl Entity {
    pub fn source_id_field(&self) -> String {
        self.source_ids.iter().cloned().collect::<Vec<_>>().join(GRAPH_FIELD_SEP)
    }
}

/// One `(level, cluster_id)` membership pair (spec.md §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClusterRef {
    pub level: u32,
    pub cluster_id: u64,
}

/// A directed graph edge. Endpoints are never sorted or canonicalized —
/// `(src, tgt)` is the direction as extracted (spec.md §3, Invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub src: String,
    pub tgt: String,
    pub weight: f64,
    pub description: String,
    pub source_ids: BTreeSet<String>,
    pub relation_type: String,
    /// Shortest-path hop distance from a local-query seed entity; filled
    /// in by the query planner, not by extraction/merge.
    #[serde(default)]
    pub order: u32,
}

impl Relationship {
    pub fn source_id_field(&self) -> String {
        self.source_ids.iter().cloned().collect::<Vec<_>>().join(GRAPH_FIELD_SEP)
    }

    /// Deduplication identity: the full directed tuple, never the sorted
    /// endpoints (spec.md §3 Invariant, §8 Invariant 5).
    pub fn identity(&self) -> (String, String, String) {
        (self.src.clone(), self.tgt.clone(), self.relation_type.clone())
    }
}

/// A cluster of entities at one hierarchical level (spec.md §3 Community).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub level: u32,
    pub cluster_id: u64,
    pub nodes: BTreeSet<String>,
    /// Directed edge pairs, direction preserved.
    pub edges: BTreeSet<(String, String)>,
    pub sub_communities: BTreeSet<u64>,
    pub occurrence: f64,
    pub chunk_ids: BTreeSet<String>,
    pub title: String,
}

/// The LLM-generated structured summary of a [`Community`] (spec.md §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityReport {
    pub level: u32,
    pub cluster_id: u64,
    pub title: String,
    pub summary: String,
    pub rating: f64,
    pub rating_explanation: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub summary: String,
    pub explanation: String,
}

/// Async ingestion tracking record (spec.md §3 Job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub phase: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_source_id_field_is_separator_joined_and_ordered() {
        let mut e = Entity {
            name: "ACME CORP".to_string(),
            entity_type: "ORGANIZATION".to_string(),
            description: "a company".to_string(),
            source_ids: BTreeSet::new(),
            clusters: vec![],
            has_vector: false,
        };
        e.source_ids.insert("chunk-b".to_string());
        e.source_ids.insert("chunk-a".to_string());
        assert_eq!(e.source_id_field(), "chunk-a<SEP>chunk-b");
    }

    #[test]
    fn relationship_identity_preserves_direction() {
        let r = Relationship {
            src: "ALICE SMITH".to_string(),
            tgt: "BOB JONES".to_string(),
            weight: 1.0,
            description: String::new(),
            source_ids: BTreeSet::new(),
            relation_type: "SUPERSEDES".to_string(),
            order: 0,
        };
        let reversed = (r.tgt.clone(), r.src.clone(), r.relation_type.clone());
        assert_ne!(r.identity(), reversed);
    }
}
