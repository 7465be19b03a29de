//! # graphrag
//!
//! **A local-first retrieval-augmented-generation engine over a
//! hierarchical knowledge graph.**
//!
//! Documents are chunked, passed through LLM entity/relationship
//! extraction, merged into a property graph, clustered into
//! hierarchical communities, and summarized into community reports.
//! Queries are answered in one of three modes: `local` (entity
//! neighborhood context), `global` (community-report map-reduce), or
//! `naive` (plain vector retrieval).
//!
//! ## Data flow
//!
//! 1. [`ingest`] chunks documents ([`graphrag_core::chunk`]), runs LLM
//!    extraction with gleaning/continuation, merges per-document
//!    records ([`graphrag_core::extraction::merge_document`]), and
//!    commits them to the graph/vector/KV stores ([`storage`]).
//! 2. [`community`] clusters the graph ([`graphrag_core::store::GraphStore::cluster`])
//!    and generates bottom-up community reports.
//! 3. [`query`] answers `local`/`global`/`naive` queries against the
//!    committed graph, vectors, and reports.
//! 4. [`jobs`] tracks the async status of long-running ingest/cluster
//!    runs; [`backup`] snapshots/restores the whole working directory.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Hierarchical TOML + env + programmatic configuration |
//! | [`progress`] | Structured `tracing` progress events for ingestion |
//! | [`llm`] | Unified LLM/embedding provider: rate limiting, caching, retries, streaming |
//! | [`storage`] | Concrete KV/vector/graph backends selected by [`config::StorageConfig`] |
//! | [`ingest`] | Chunk → extract → merge → commit pipeline |
//! | [`community`] | Graph clustering and community report generation |
//! | [`query`] | Local/global/naive query planner |
//! | [`jobs`] | Async job tracking over a [`graphrag_core::store::KvStore`] |
//! | [`backup`] | `.ngbak` backup/restore bundles |

pub mod config;
pub mod progress;
pub mod llm;
pub mod storage;
pub mod jobs;
pub mod ingest;
pub mod community;
pub mod query;
pub mod backup;
