//! Storage abstraction (spec.md §4.1).
//!
//! Three orthogonal contracts — key-value, vector, graph — each with a
//! pure in-memory reference implementation here. A backend implements
//! exactly one contract per instance; the `graphrag` app crate adds
//! file-backed persistence and the Redis/Qdrant/Neo4j backends behind
//! feature flags, wrapping these same traits.

pub mod graph;
pub mod kv;
pub mod vector;

pub use graph::{CommunitySchemaEntry, GraphBatch, GraphStore, InMemoryGraphStore, NodeAttrs, EdgeAttrs};
pub use kv::{InMemoryKvStore, KvStore};
pub use vector::{InMemoryVectorStore, VectorRecord, VectorSearchHit, VectorStore};
