//! Scenario B (spec.md §8): ingesting the same document twice must leave
//! the graph and vector store in the same state as a single ingest —
//! `source_id` sets must not grow and edge weights must not double
//! (invariant 3).

mod common;

use std::sync::Arc;

use common::{extraction_response, ScriptedLlm, StubEmbeddings};
use graphrag::config::Config;
use graphrag::ingest::IngestEngine;
use graphrag_core::models::Document;
use graphrag_core::store::{InMemoryGraphStore, InMemoryKvStore, InMemoryVectorStore};

#[tokio::test]
async fn reingesting_the_same_document_does_not_grow_state() {
    let kv = Arc::new(InMemoryKvStore::new());
    let vector = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let embeddings = Arc::new(StubEmbeddings);

    let doc = Document { id: "doc-1".to_string(), content: "Alice works at Acme.".to_string(), metadata: serde_json::Value::Null };
    let extraction = extraction_response(&[("Alice", "PERSON", "a person"), ("Acme", "ORGANIZATION", "a company")], &[("Alice", "Acme", "works at", 1.0)]);

    // First ingest.
    let llm = Arc::new(ScriptedLlm::new(vec![extraction.as_str(), ""]));
    let ingest = IngestEngine::new(kv.clone(), vector.clone(), graph.clone(), llm, embeddings.clone(), Config::default());
    ingest.ingest_documents(vec![doc.clone()], "job-1").await.unwrap();

    let edge_after_first = graph.get_edge("ALICE", "ACME").await.unwrap().unwrap();
    let weight_after_first = edge_after_first.get("weight").and_then(|v| v.as_f64()).unwrap();
    let source_id_after_first = edge_after_first.get("source_id").and_then(|v| v.as_str()).unwrap().to_string();

    // Second ingest of the identical document.
    let llm = Arc::new(ScriptedLlm::new(vec![extraction.as_str(), ""]));
    let ingest = IngestEngine::new(kv.clone(), vector.clone(), graph.clone(), llm, embeddings.clone(), Config::default());
    ingest.ingest_documents(vec![doc], "job-2").await.unwrap();

    let edge_after_second = graph.get_edge("ALICE", "ACME").await.unwrap().unwrap();
    assert_eq!(edge_after_second.get("weight").and_then(|v| v.as_f64()).unwrap(), weight_after_first, "weight must not double on re-ingest");
    assert_eq!(edge_after_second.get("source_id").and_then(|v| v.as_str()).unwrap(), source_id_after_first, "source_id set must not grow on re-ingest");

    let entity_hits = vector.query("entities", &[1.0, 0.0], 10).await.unwrap();
    assert_eq!(entity_hits.len(), 2, "re-ingest must not duplicate entity vectors");

    let chunk_hits = vector.query("chunks", &[1.0, 0.0], 10).await.unwrap();
    assert_eq!(chunk_hits.len(), 1, "the same chunk id must overwrite, not duplicate, its vector entry");
}
