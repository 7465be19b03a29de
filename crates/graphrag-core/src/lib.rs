//! # graphrag-core
//!
//! Dependency-light core of the graphrag engine: data model, chunker,
//! storage *contracts* (key-value, vector, graph), the sum-typed extraction
//! record types, token-budgeting helpers for query-context assembly, and
//! the error taxonomy.
//!
//! This crate has no `tokio`, no database client, and no network
//! dependency. Concrete storage backends and the LLM/embedding provider
//! implementations live in the `graphrag` application crate.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod ids;
pub mod models;
pub mod store;
