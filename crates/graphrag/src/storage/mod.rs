//! Concrete storage backends and the config-driven factory that selects
//! among them (spec.md §4.1, §9 "Dynamic dispatch over storage
//! backends"). A backend's heavy dependencies (Qdrant client, Neo4j
//! driver) must not be loaded unless that backend's feature is compiled
//! in and its token is selected — the factory below is the only place
//! that branches on the config token.

mod file;
#[cfg(feature = "neo4j-backend")]
mod neo4j_backend;
#[cfg(feature = "qdrant-backend")]
mod qdrant_backend;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use file::{FileGraphStore, FileKvStore, FileVectorStore};
#[cfg(feature = "neo4j-backend")]
pub use neo4j_backend::Neo4jGraphStore;
#[cfg(feature = "qdrant-backend")]
pub use qdrant_backend::QdrantVectorStore;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisKvStore;

use std::sync::Arc;

use graphrag_core::store::{GraphStore, KvStore, VectorStore};

use crate::config::StorageConfig;

pub async fn create_kv_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match config.kv_backend.as_str() {
        "json" => Ok(Arc::new(FileKvStore::new(&config.working_dir))),
        #[cfg(feature = "redis-backend")]
        "redis" => Ok(Arc::new(RedisKvStore::connect(&config.redis).await?)),
        #[cfg(not(feature = "redis-backend"))]
        "redis" => anyhow::bail!("storage.kv_backend = 'redis' requires the 'redis-backend' feature"),
        other => anyhow::bail!("unknown storage.kv_backend '{other}'"),
    }
}

pub async fn create_vector_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn VectorStore>> {
    match config.vector_backend.as_str() {
        "nano" | "hnsw" => Ok(Arc::new(FileVectorStore::new(&config.working_dir))),
        #[cfg(feature = "qdrant-backend")]
        "qdrant" => Ok(Arc::new(QdrantVectorStore::connect(&config.qdrant, &config.hybrid_search).await?)),
        #[cfg(not(feature = "qdrant-backend"))]
        "qdrant" => anyhow::bail!("storage.vector_backend = 'qdrant' requires the 'qdrant-backend' feature"),
        other => anyhow::bail!("unknown storage.vector_backend '{other}'"),
    }
}

pub async fn create_graph_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    match config.graph_backend.as_str() {
        "networkx" => Ok(Arc::new(FileGraphStore::new(&config.working_dir))),
        #[cfg(feature = "neo4j-backend")]
        "neo4j" => Ok(Arc::new(Neo4jGraphStore::connect(&config.neo4j).await?)),
        #[cfg(not(feature = "neo4j-backend"))]
        "neo4j" => anyhow::bail!("storage.graph_backend = 'neo4j' requires the 'neo4j-backend' feature"),
        other => anyhow::bail!("unknown storage.graph_backend '{other}'"),
    }
}
