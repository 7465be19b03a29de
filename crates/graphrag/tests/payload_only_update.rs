//! Scenario F (spec.md §8): after ingest embeds an entity, updating its
//! vector payload must leave the stored embedding and `content` untouched
//! and must only change the targeted payload field (invariant 4, vector
//! immutability).

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{extraction_response, ScriptedLlm, StubEmbeddings};
use graphrag::config::Config;
use graphrag::ingest::IngestEngine;
use graphrag_core::models::Document;
use graphrag_core::store::{InMemoryGraphStore, InMemoryKvStore, InMemoryVectorStore, VectorStore};

#[tokio::test]
async fn update_payload_leaves_the_embedding_and_content_untouched() {
    let kv = Arc::new(InMemoryKvStore::new());
    let vector = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let embeddings = Arc::new(StubEmbeddings);

    let extraction = extraction_response(&[("Alice", "PERSON", "a person")], &[]);
    let llm = Arc::new(ScriptedLlm::new(vec![extraction.as_str(), ""]));
    let doc = Document { id: "doc-1".to_string(), content: "Alice is a person.".to_string(), metadata: serde_json::Value::Null };
    let ingest = IngestEngine::new(kv, vector.clone(), graph, llm, embeddings, Config::default());
    ingest.ingest_documents(vec![doc], "job-1").await.unwrap();

    let before = vector.query("entities", &[1.0, 0.0], 10).await.unwrap();
    assert_eq!(before.len(), 1);
    let original_content = before[0].content.clone();

    vector.update_payload("entities", "ALICE", HashMap::from([("community_description".to_string(), serde_json::json!("new text"))])).await.unwrap();

    let after = vector.query("entities", &[1.0, 0.0], 10).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].score, before[0].score, "the stored vector must be byte-identical after a payload-only update");
    assert_eq!(after[0].content, original_content, "content must not change on a payload-only update");
    assert_eq!(after[0].extra_payload.get("community_description"), Some(&serde_json::json!("new text")));

    let rejected = vector.update_payload("entities", "ALICE", HashMap::from([("embedding".to_string(), serde_json::json!([9.9, 9.9]))])).await;
    assert!(rejected.is_err(), "update_payload must reject attempts to touch the embedding field");
}
