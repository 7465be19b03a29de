//! Scenario C (spec.md §8): two different documents with identical content
//! must still produce two distinct chunks — chunk IDs are scoped by
//! `doc_id`, not by content alone (invariant 1).

mod common;

use std::sync::Arc;

use common::{ScriptedLlm, StubEmbeddings};
use graphrag::config::Config;
use graphrag::ingest::IngestEngine;
use graphrag_core::models::Document;
use graphrag_core::store::{InMemoryGraphStore, InMemoryKvStore, InMemoryVectorStore};

#[tokio::test]
async fn identical_content_in_two_documents_yields_two_distinct_chunks() {
    let kv = Arc::new(InMemoryKvStore::new());
    let vector = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let embeddings = Arc::new(StubEmbeddings);

    // No entities/relationships in the extraction responses: this scenario
    // is about chunk identity, not extraction content.
    let llm = Arc::new(ScriptedLlm::new(vec!["", "", "", ""]));
    let ingest = IngestEngine::new(kv.clone(), vector.clone(), graph.clone(), llm, embeddings, Config::default());

    let doc_a = Document { id: "doc-a".to_string(), content: "The quick brown fox.".to_string(), metadata: serde_json::Value::Null };
    let doc_b = Document { id: "doc-b".to_string(), content: "The quick brown fox.".to_string(), metadata: serde_json::Value::Null };
    ingest.ingest_documents(vec![doc_a, doc_b], "job-1").await.unwrap();

    let chunk_ids = kv.all_keys("text_chunks").await.unwrap();
    assert_eq!(chunk_ids.len(), 2, "identical content in two documents must still produce two distinct chunk ids");

    let chunk_hits = vector.query("chunks", &[1.0, 0.0], 10).await.unwrap();
    assert_eq!(chunk_hits.len(), 2);
}
