//! Ingestion pipeline: chunk → extract → merge → commit (spec.md §4.3).
//!
//! One document at a time: chunk, run LLM extraction per chunk (with
//! gleaning and continuation-on-truncation), merge every chunk's records
//! into one entity/relationship set, commit that set to the graph as a
//! single [`GraphBatch`], then embed and upsert the merged entities into
//! the `entities` vector namespace. A chunk that fails extraction after
//! retries is logged and skipped rather than failing the whole document;
//! a document whose graph commit fails is logged and skipped rather than
//! failing the whole ingest run — later documents still get a chance.

use std::collections::HashMap;
use std::sync::Arc;

use graphrag_core::chunk::chunk_document;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::extraction::{
    clamp_records, looks_truncated, merge_document, parse_records, ChunkExtraction, RelationPattern, COMPLETION_DELIMITER, RECORD_DELIMITER,
    TUPLE_DELIMITER,
};
use graphrag_core::models::{Chunk, Document, Entity, Relationship};
use graphrag_core::store::{GraphBatch, GraphStore, KvStore, VectorRecord, VectorStore};
use tracing::warn;

use crate::config::Config;
use crate::llm::{ChatMessage, EmbeddingClient, LlmProvider};
use crate::progress::{report, IngestPhase};

const EXTRACTION_PROMPT: &str = "\
You are extracting entities and relationships from the text below.

Entity types to look for: {entity_types}

For each entity, output exactly:
(\"entity\"{td}<name>{td}<entity type>{td}<description>){rd}

For each relationship between two entities, output exactly:
(\"relationship\"{td}<source entity>{td}<target entity>{td}<description>{td}<weight 0.0-1.0>){rd}

When you have extracted everything, end your output with {cd}

Text:
{content}
";

const GLEAN_PROMPT: &str = "\
MANY entities and relationships were missed in the last extraction. Using the \
same format as before, output ONLY the ones you missed. If there are none, \
output nothing.
";

const CONTINUE_PROMPT: &str = "\
Your last response was cut off before it reached the completion marker. \
Continue exactly where you left off, in the same tuple format.
";

fn build_extraction_prompt(content: &str, entity_types: &[String]) -> String {
    EXTRACTION_PROMPT
        .replace("{entity_types}", &entity_types.join(", "))
        .replace("{td}", TUPLE_DELIMITER)
        .replace("{rd}", RECORD_DELIMITER)
        .replace("{cd}", COMPLETION_DELIMITER)
        .replace("{content}", content)
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestSummary {
    pub documents_ingested: usize,
    pub documents_failed: usize,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,
    pub entities_upserted: usize,
    pub relationships_upserted: usize,
}

pub struct IngestEngine {
    kv: Arc<dyn KvStore>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: Config,
}

impl IngestEngine {
    pub fn new(kv: Arc<dyn KvStore>, vector: Arc<dyn VectorStore>, graph: Arc<dyn GraphStore>, llm: Arc<dyn LlmProvider>, embeddings: Arc<dyn EmbeddingClient>, config: Config) -> Self {
        Self { kv, vector, graph, llm, embeddings, config }
    }

    pub async fn ingest_documents(&self, documents: Vec<Document>, job_id: &str) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let relation_patterns: Vec<RelationPattern> = self
            .config
            .entity_extraction
            .relation_patterns
            .iter()
            .map(|(pattern, label)| RelationPattern { pattern: pattern.clone(), label: label.clone() })
            .collect();

        for (doc_index, document) in documents.iter().enumerate() {
            report(job_id, IngestPhase::Chunking, doc_index as u64, documents.len() as u64);
            let chunks = chunk_document(&document.id, &document.content, self.config.chunking.size, self.config.chunking.overlap)?;

            self.kv
                .upsert("full_docs", HashMap::from([(document.id.clone(), serde_json::json!({"content": document.content, "metadata": document.metadata}))]))
                .await?;
            let chunk_records: HashMap<String, serde_json::Value> = chunks
                .iter()
                .map(|c| {
                    (
                        c.id.clone(),
                        serde_json::json!({"content": c.content, "full_doc_id": c.full_doc_id, "chunk_order_index": c.chunk_order_index, "tokens": c.tokens}),
                    )
                })
                .collect();
            self.kv.upsert("text_chunks", chunk_records).await?;
            if let Err(err) = self.upsert_chunk_vectors(&chunks).await {
                warn!(target: "graphrag::ingest", job_id, document_id = %document.id, error = %err, "chunk vector upsert failed");
            }

            report(job_id, IngestPhase::Extracting, doc_index as u64, documents.len() as u64);
            let mut chunk_extractions = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                summary.chunks_processed += 1;
                match self.extract_chunk(&chunk.content).await {
                    Ok(records) => chunk_extractions.push(ChunkExtraction { chunk_id: chunk.id.clone(), records }),
                    Err(err) => {
                        summary.chunks_skipped += 1;
                        warn!(target: "graphrag::ingest", job_id, chunk_id = %chunk.id, error = %err, "chunk extraction failed, skipping chunk");
                    }
                }
            }

            report(job_id, IngestPhase::Merging, doc_index as u64, documents.len() as u64);
            let (entities, relationships) = merge_document(&chunk_extractions, &relation_patterns);

            report(job_id, IngestPhase::CommittingGraph, doc_index as u64, documents.len() as u64);
            let batch = build_graph_batch(&entities, &relationships);
            if let Err(err) = self.graph.execute_document_batch(batch).await {
                summary.documents_failed += 1;
                warn!(target: "graphrag::ingest", job_id, document_id = %document.id, error = %err, "graph commit failed, skipping document");
                continue;
            }

            report(job_id, IngestPhase::UpsertingVectors, doc_index as u64, documents.len() as u64);
            if let Err(err) = self.upsert_entity_vectors(&entities).await {
                warn!(target: "graphrag::ingest", job_id, document_id = %document.id, error = %err, "entity vector upsert failed");
            }

            summary.documents_ingested += 1;
            summary.entities_upserted += entities.len();
            summary.relationships_upserted += relationships.len();
        }

        self.graph.index_done().await?;
        self.vector.index_done().await?;
        self.kv.index_done().await?;
        Ok(summary)
    }

    async fn extract_chunk(&self, content: &str) -> Result<Vec<graphrag_core::extraction::ExtractionRecord>> {
        let prompt = build_extraction_prompt(content, &self.config.entity_extraction.entity_types);
        let mut raw = self.llm.complete(&prompt, &[]).await?;
        let mut history = vec![ChatMessage { role: "user".to_string(), content: prompt.clone() }, ChatMessage { role: "assistant".to_string(), content: raw.clone() }];

        let mut attempts = 0;
        while looks_truncated(&raw, RECORD_DELIMITER, COMPLETION_DELIMITER) && attempts < self.config.llm.max_continuation_attempts {
            attempts += 1;
            let more = self.llm.complete(CONTINUE_PROMPT, &history).await?;
            history.push(ChatMessage { role: "assistant".to_string(), content: more.clone() });
            raw.push_str(&more);
        }

        let mut records = parse_records(&raw, TUPLE_DELIMITER, RECORD_DELIMITER);

        for _ in 0..self.config.llm.max_gleaning {
            let gleaned = self.llm.complete(GLEAN_PROMPT, &history).await?;
            let trimmed = gleaned.trim();
            if trimmed.is_empty() || trimmed == COMPLETION_DELIMITER {
                break;
            }
            history.push(ChatMessage { role: "assistant".to_string(), content: gleaned.clone() });
            records.extend(parse_records(&gleaned, TUPLE_DELIMITER, RECORD_DELIMITER));
        }

        let (clamped, did_clamp) = clamp_records(records, self.config.entity_extraction.max_entities_per_chunk, self.config.entity_extraction.max_edges_per_chunk);
        if did_clamp {
            warn!(target: "graphrag::ingest", "extraction clamped to configured per-chunk entity/edge limits");
        }
        Ok(clamped)
    }

    async fn upsert_entity_vectors(&self, entities: &[Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let contents: Vec<String> = entities.iter().map(entity_embedding_content).collect();
        let embeddings = self.embeddings.embed(&contents).await?;
        let records = entities
            .iter()
            .zip(contents)
            .zip(embeddings)
            .map(|((entity, content), embedding)| VectorRecord {
                id: entity.name.clone(),
                content,
                embedding,
                extra_payload: HashMap::from([
                    ("entity_type".to_string(), serde_json::json!(entity.entity_type)),
                    ("source_id".to_string(), serde_json::json!(entity.source_id_field())),
                ]),
            })
            .collect();
        self.vector.upsert("entities", records).await
    }

    /// Embeds and upserts every chunk of a document into the `chunks`
    /// namespace, independent of whether extraction found anything — the
    /// naive query mode retrieves text units directly by vector
    /// similarity and has no dependency on the graph.
    async fn upsert_chunk_vectors(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embeddings.embed(&contents).await?;
        let records = chunks
            .iter()
            .zip(contents)
            .zip(embeddings)
            .map(|((chunk, content), embedding)| VectorRecord {
                id: chunk.id.clone(),
                content,
                embedding,
                extra_payload: HashMap::from([("full_doc_id".to_string(), serde_json::json!(chunk.full_doc_id))]),
            })
            .collect();
        self.vector.upsert("chunks", records).await
    }
}

fn entity_embedding_content(entity: &Entity) -> String {
    format!("{} [{}] {}", entity.name, entity.entity_type, entity.description)
}

fn build_graph_batch(entities: &[Entity], relationships: &[Relationship]) -> GraphBatch {
    let mut batch = GraphBatch::default();
    for entity in entities {
        let attrs = HashMap::from([
            ("entity_type".to_string(), serde_json::json!(entity.entity_type)),
            ("description".to_string(), serde_json::json!(entity.description)),
            ("source_id".to_string(), serde_json::json!(entity.source_id_field())),
        ]);
        batch.nodes.push((entity.name.clone(), attrs));
    }
    for rel in relationships {
        let attrs = HashMap::from([
            ("weight".to_string(), serde_json::json!(rel.weight)),
            ("description".to_string(), serde_json::json!(rel.description)),
            ("source_id".to_string(), serde_json::json!(rel.source_id_field())),
            ("relation_type".to_string(), serde_json::json!(rel.relation_type)),
        ]);
        batch.edges.push((rel.src.clone(), rel.tgt.clone(), attrs));
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrag_core::store::{InMemoryGraphStore, InMemoryKvStore, InMemoryVectorStore};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        responses: Mutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().map(str::to_string).collect()) }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, _prompt: &str, _history: &[ChatMessage]) -> std::result::Result<String, GraphRagError> {
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
        }

        fn stream_complete(&self, _prompt: &str, _history: &[ChatMessage]) -> mpsc::Receiver<std::result::Result<String, GraphRagError>> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    struct StubEmbeddings;

    #[async_trait::async_trait]
    impl EmbeddingClient for StubEmbeddings {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, GraphRagError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn engine(llm: ScriptedLlm) -> IngestEngine {
        IngestEngine::new(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(llm),
            Arc::new(StubEmbeddings),
            Config::default(),
        )
    }

    fn sample_tuple_response() -> String {
        format!(
            "(\"entity\"{td}\"Alice Smith\"{td}person{td}a person){rd}(\"relationship\"{td}\"Alice Smith\"{td}\"Acme Corp\"{td}works at{td}1.0){rd}{cd}",
            td = TUPLE_DELIMITER,
            rd = RECORD_DELIMITER,
            cd = COMPLETION_DELIMITER
        )
    }

    #[tokio::test]
    async fn ingest_commits_merged_entities_and_relationships_to_the_graph() {
        let responses = vec![sample_tuple_response(), String::new()];
        let engine = engine(ScriptedLlm::new(responses.iter().map(String::as_str).collect()));
        let doc = Document { id: "doc-1".to_string(), content: "Alice works at Acme.".to_string(), metadata: serde_json::Value::Null };
        let summary = engine.ingest_documents(vec![doc], "job-1").await.unwrap();
        assert_eq!(summary.documents_ingested, 1);
        assert_eq!(summary.entities_upserted, 1);
        assert!(engine.graph.has_node("ALICE SMITH").await.unwrap());
        assert!(engine.graph.has_edge("ALICE SMITH", "ACME CORP").await.unwrap());
    }

    #[tokio::test]
    async fn ingest_upserts_entity_embeddings_into_the_vector_store() {
        let responses = vec![sample_tuple_response(), String::new()];
        let engine = engine(ScriptedLlm::new(responses.iter().map(String::as_str).collect()));
        let doc = Document { id: "doc-1".to_string(), content: "Alice works at Acme.".to_string(), metadata: serde_json::Value::Null };
        engine.ingest_documents(vec![doc], "job-1").await.unwrap();
        let hits = engine.vector.query("entities", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ALICE SMITH");
    }

    #[tokio::test]
    async fn ingest_populates_full_docs_text_chunks_and_chunk_vectors() {
        let responses = vec![sample_tuple_response(), String::new()];
        let engine = engine(ScriptedLlm::new(responses.iter().map(String::as_str).collect()));
        let doc = Document { id: "doc-1".to_string(), content: "Alice works at Acme.".to_string(), metadata: serde_json::Value::Null };
        engine.ingest_documents(vec![doc], "job-1").await.unwrap();

        let full_doc = engine.kv.get("full_docs", "doc-1").await.unwrap();
        assert!(full_doc.is_some(), "full_docs must retain the original document content");

        let hits = engine.vector.query("chunks", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1, "every chunk must be embedded into the chunks vector namespace");

        let chunk_record = engine.kv.get("text_chunks", &hits[0].id).await.unwrap();
        assert!(chunk_record.is_some(), "text_chunks must retain chunk content keyed by chunk id");
    }

    #[tokio::test]
    async fn continuation_is_requested_when_the_first_response_is_truncated() {
        let truncated = "(\"entity\"<|>\"Alice Smith\"<|>person<|>a person)".to_string();
        let continuation = format!("##{}", COMPLETION_DELIMITER);
        let responses = vec![truncated, continuation, String::new()];
        let engine = engine(ScriptedLlm::new(responses.iter().map(String::as_str).collect()));
        let records = engine.extract_chunk("Alice is a person.").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn a_failing_chunk_does_not_abort_the_whole_document() {
        struct FailingThenOkLlm {
            calls: std::sync::atomic::AtomicU32,
        }
        #[async_trait::async_trait]
        impl LlmProvider for FailingThenOkLlm {
            async fn complete(&self, _prompt: &str, _history: &[ChatMessage]) -> std::result::Result<String, GraphRagError> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Err(GraphRagError::permanent("extraction call failed"))
                } else {
                    Ok(String::new())
                }
            }
            fn stream_complete(&self, _prompt: &str, _history: &[ChatMessage]) -> mpsc::Receiver<std::result::Result<String, GraphRagError>> {
                let (_tx, rx) = mpsc::channel(1);
                rx
            }
        }
        let engine = IngestEngine::new(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(FailingThenOkLlm { calls: std::sync::atomic::AtomicU32::new(0) }),
            Arc::new(StubEmbeddings),
            Config::default(),
        );
        let long_doc = "word ".repeat(2000);
        let doc = Document { id: "doc-1".to_string(), content: long_doc, metadata: serde_json::Value::Null };
        let summary = engine.ingest_documents(vec![doc], "job-1").await.unwrap();
        assert!(summary.chunks_skipped >= 1, "the first chunk's extraction failure must be recorded, not propagated");
        assert_eq!(summary.documents_ingested, 1, "remaining chunks still let the document succeed overall");
    }
}
