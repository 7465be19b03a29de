//! Community detection and report generation (spec.md §4.4).
//!
//! After ingestion, [`CommunityEngine::cluster_and_summarize`] runs graph
//! clustering ([`GraphStore::cluster`]), reads back the resulting schema
//! ([`GraphStore::community_schema`]), and generates one LLM-written
//! report per community: a title, a summary, a 0-10 rating, and a list of
//! findings. Generation runs bottom-up (finest level first) so a coarser
//! community's prompt can fold in its already-generated sub-community
//! summaries instead of re-deriving them from raw entities/relationships.

use std::collections::HashMap;
use std::sync::Arc;

use graphrag_core::context::CsvTable;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::models::{CommunityReport, Finding};
use graphrag_core::store::{GraphStore, KvStore, VectorRecord, VectorStore};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::llm::{EmbeddingClient, LlmProvider};
use crate::progress::{report, IngestPhase};

const REPORT_PROMPT: &str = "\
You are summarizing one community of a knowledge graph.

-----ENTITIES-----
{entities}

-----RELATIONSHIPS-----
{relationships}

-----SUB-COMMUNITY SUMMARIES-----
{sub_communities}

Respond with a single JSON object with exactly these fields:
{{\"title\": string, \"summary\": string, \"rating\": number (0-10), \"rating_explanation\": string, \"findings\": [{{\"summary\": string, \"explanation\": string}}]}}
";

#[derive(Debug, Deserialize)]
struct ReportJson {
    title: String,
    summary: String,
    rating: f64,
    rating_explanation: String,
    findings: Vec<FindingJson>,
}

#[derive(Debug, Deserialize)]
struct FindingJson {
    summary: String,
    explanation: String,
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim()
}

pub struct CommunityEngine {
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    kv: Arc<dyn KvStore>,
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: Config,
}

impl CommunityEngine {
    pub fn new(graph: Arc<dyn GraphStore>, vector: Arc<dyn VectorStore>, kv: Arc<dyn KvStore>, llm: Arc<dyn LlmProvider>, embeddings: Arc<dyn EmbeddingClient>, config: Config) -> Self {
        Self { graph, vector, kv, llm, embeddings, config }
    }

    pub async fn cluster_and_summarize(&self, job_id: &str) -> Result<Vec<CommunityReport>> {
        report(job_id, IngestPhase::Clustering, 0, 0);
        self.graph.cluster(self.config.graph_clustering.max_cluster_size, self.config.graph_clustering.random_seed).await?;

        let schema = self.graph.community_schema().await?;
        let mut keys: Vec<(u32, u64)> = schema.keys().filter_map(|k| parse_key(k)).collect();
        keys.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        report(job_id, IngestPhase::GeneratingReports, 0, keys.len() as u64);
        let mut generated: HashMap<(u32, u64), CommunityReport> = HashMap::new();
        let mut reports = Vec::with_capacity(keys.len());

        for (i, (level, cluster_id)) in keys.iter().enumerate() {
            let entry = &schema[&format!("{level}-{cluster_id}")];
            match self.summarize_one(*level, *cluster_id, entry, &generated).await {
                Ok(r) => {
                    generated.insert((*level, *cluster_id), r.clone());
                    reports.push(r);
                }
                Err(err) => {
                    warn!(target: "graphrag::community", job_id, level, cluster_id, error = %err, "community report generation failed, skipping community");
                }
            }
            report(job_id, IngestPhase::GeneratingReports, (i + 1) as u64, keys.len() as u64);
        }

        self.kv.index_done().await?;
        self.vector.index_done().await?;
        Ok(reports)
    }

    async fn summarize_one(
        &self,
        level: u32,
        cluster_id: u64,
        entry: &graphrag_core::store::CommunitySchemaEntry,
        generated: &HashMap<(u32, u64), CommunityReport>,
    ) -> Result<CommunityReport> {
        let node_attrs = self.graph.get_nodes_batch(&entry.nodes).await?;
        let mut entities = CsvTable::new(vec!["entity".into(), "type".into(), "description".into()], Some(2));
        for (name, attrs) in entry.nodes.iter().zip(node_attrs) {
            let Some(attrs) = attrs else { continue };
            entities.push_row(vec![
                name.clone(),
                attrs.get("entity_type").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string(),
                attrs.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
            ]);
        }

        let edge_attrs = self.graph.get_edges_batch(&entry.edges).await?;
        let mut relationships = CsvTable::new(vec!["source".into(), "target".into(), "description".into()], Some(2));
        for ((src, tgt), attrs) in entry.edges.iter().zip(edge_attrs) {
            let Some(attrs) = attrs else { continue };
            relationships.push_row(vec![src.clone(), tgt.clone(), attrs.get("description").and_then(Value::as_str).unwrap_or_default().to_string()]);
        }

        let budget = self.config.query.best_model_max_token_size;
        let own_context_exceeds_budget = entities.token_len() + relationships.token_len() > budget * 3 / 4;

        let mut sub_summaries = CsvTable::new(vec!["community".into(), "summary".into()], Some(1));
        let force = self.config.graph_clustering.force_to_use_sub_communities;
        if force || own_context_exceeds_budget {
            for sub_id in &entry.sub_communities {
                if let Some(sub_level) = level.checked_add(1) {
                    if let Some(sub_report) = generated.get(&(sub_level, *sub_id)) {
                        sub_summaries.push_row(vec![sub_report.title.clone(), sub_report.summary.clone()]);
                    }
                }
            }
        }

        entities.fit_to_budget(budget / 2);
        relationships.fit_to_budget(budget / 4);
        sub_summaries.fit_to_budget(budget / 4);

        let prompt = REPORT_PROMPT
            .replace("{entities}", &entities.render())
            .replace("{relationships}", &relationships.render())
            .replace("{sub_communities}", &sub_summaries.render());

        let raw = self.llm.complete(&prompt, &[]).await?;
        let parsed: ReportJson = serde_json::from_str(strip_code_fence(&raw)).map_err(|e| GraphRagError::permanent(format!("malformed community report JSON: {e}")))?;

        let report = CommunityReport {
            level,
            cluster_id,
            title: parsed.title,
            summary: parsed.summary,
            rating: parsed.rating,
            rating_explanation: parsed.rating_explanation,
            findings: parsed.findings.into_iter().map(|f| Finding { summary: f.summary, explanation: f.explanation }).collect(),
        };

        self.persist(&report).await?;
        Ok(report)
    }

    async fn persist(&self, report: &CommunityReport) -> Result<()> {
        let key = format!("{}-{}", report.level, report.cluster_id);
        let value = serde_json::to_value(report).map_err(|e| GraphRagError::Internal(format!("community report serialization failed: {e}")))?;
        self.kv.upsert("community_reports", HashMap::from([(key.clone(), value)])).await?;

        let embedding_content = format!("{} {}", report.title, report.summary);
        let embedding = self
            .embeddings
            .embed(std::slice::from_ref(&embedding_content))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        self.vector
            .upsert(
                "community_reports",
                vec![VectorRecord {
                    id: key,
                    content: embedding_content,
                    embedding,
                    extra_payload: HashMap::from([("level".to_string(), serde_json::json!(report.level)), ("rating".to_string(), serde_json::json!(report.rating))]),
                }],
            )
            .await
    }
}

fn parse_key(key: &str) -> Option<(u32, u64)> {
    let (level, cluster_id) = key.split_once('-')?;
    Some((level.parse().ok()?, cluster_id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrag_core::store::{EdgeAttrs, GraphBatch, InMemoryGraphStore, InMemoryKvStore, InMemoryVectorStore, NodeAttrs};
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, _prompt: &str, _history: &[crate::llm::ChatMessage]) -> std::result::Result<String, GraphRagError> {
            Ok(self.response.clone())
        }
        fn stream_complete(&self, _prompt: &str, _history: &[crate::llm::ChatMessage]) -> mpsc::Receiver<std::result::Result<String, GraphRagError>> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    struct CapturingLlm {
        response: String,
        last_prompt: std::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for CapturingLlm {
        async fn complete(&self, prompt: &str, _history: &[crate::llm::ChatMessage]) -> std::result::Result<String, GraphRagError> {
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            Ok(self.response.clone())
        }
        fn stream_complete(&self, _prompt: &str, _history: &[crate::llm::ChatMessage]) -> mpsc::Receiver<std::result::Result<String, GraphRagError>> {
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

    async fn seeded_graph() -> Arc<dyn GraphStore> {
        let graph = InMemoryGraphStore::new();
        let mut batch = GraphBatch::default();
        batch.nodes.push(("ALICE".to_string(), NodeAttrs::from([("entity_type".to_string(), serde_json::json!("PERSON")), ("description".to_string(), serde_json::json!("a person"))])));
        batch.nodes.push(("ACME".to_string(), NodeAttrs::from([("entity_type".to_string(), serde_json::json!("ORGANIZATION")), ("description".to_string(), serde_json::json!("a company"))])));
        batch.edges.push(("ALICE".to_string(), "ACME".to_string(), EdgeAttrs::from([("description".to_string(), serde_json::json!("works at"))])));
        graph.execute_document_batch(batch).await.unwrap();
        Arc::new(graph)
    }

    #[tokio::test]
    async fn cluster_and_summarize_produces_one_report_per_community() {
        let graph = seeded_graph().await;
        let response = serde_json::json!({
            "title": "Alice and Acme",
            "summary": "Alice works at Acme.",
            "rating": 5.0,
            "rating_explanation": "small but coherent community",
            "findings": [{"summary": "employment link", "explanation": "Alice is employed by Acme"}]
        })
        .to_string();
        let engine = CommunityEngine::new(
            graph,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(ScriptedLlm { response }),
            Arc::new(StubEmbeddings),
            Config::default(),
        );
        let reports = engine.cluster_and_summarize("job-1").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].title, "Alice and Acme");
        assert_eq!(reports[0].findings.len(), 1);
    }

    #[tokio::test]
    async fn malformed_llm_response_skips_that_community_without_failing_the_run() {
        let graph = seeded_graph().await;
        let engine = CommunityEngine::new(
            graph,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(ScriptedLlm { response: "not json".to_string() }),
            Arc::new(StubEmbeddings),
            Config::default(),
        );
        let reports = engine.cluster_and_summarize("job-1").await.unwrap();
        assert!(reports.is_empty());
    }

    fn report_response() -> String {
        serde_json::json!({
            "title": "t", "summary": "s", "rating": 1.0, "rating_explanation": "r", "findings": []
        })
        .to_string()
    }

    fn dummy_sub_report() -> CommunityReport {
        CommunityReport { level: 1, cluster_id: 7, title: "Sub Report Title".to_string(), summary: "sub report summary text".to_string(), rating: 3.0, rating_explanation: String::new(), findings: vec![] }
    }

    #[tokio::test]
    async fn sub_community_summaries_are_omitted_when_own_context_fits_budget_and_flag_is_off() {
        let graph = seeded_graph().await;
        let llm = Arc::new(CapturingLlm { response: report_response(), last_prompt: std::sync::Mutex::new(None) });
        let engine = CommunityEngine::new(graph, Arc::new(InMemoryVectorStore::new()), Arc::new(InMemoryKvStore::new()), llm.clone(), Arc::new(StubEmbeddings), Config::default());

        let entry = graphrag_core::store::CommunitySchemaEntry {
            level: 0,
            title: "Community 0".to_string(),
            edges: vec![("ALICE".to_string(), "ACME".to_string())],
            nodes: vec!["ALICE".to_string(), "ACME".to_string()],
            sub_communities: vec![7],
            occurrence: 2.0,
            chunk_ids: vec![],
        };
        let generated = HashMap::from([((1u32, 7u64), dummy_sub_report())]);
        engine.summarize_one(0, 0, &entry, &generated).await.unwrap();

        let prompt = llm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(!prompt.contains("Sub Report Title"), "own context is tiny and force flag is off, so the sub-community CSV should stay empty");
    }

    #[tokio::test]
    async fn sub_community_summaries_are_folded_in_when_force_flag_is_set() {
        let graph = seeded_graph().await;
        let llm = Arc::new(CapturingLlm { response: report_response(), last_prompt: std::sync::Mutex::new(None) });
        let mut config = Config::default();
        config.graph_clustering.force_to_use_sub_communities = true;
        let engine = CommunityEngine::new(graph, Arc::new(InMemoryVectorStore::new()), Arc::new(InMemoryKvStore::new()), llm.clone(), Arc::new(StubEmbeddings), config);

        let entry = graphrag_core::store::CommunitySchemaEntry {
            level: 0,
            title: "Community 0".to_string(),
            edges: vec![("ALICE".to_string(), "ACME".to_string())],
            nodes: vec!["ALICE".to_string(), "ACME".to_string()],
            sub_communities: vec![7],
            occurrence: 2.0,
            chunk_ids: vec![],
        };
        let generated = HashMap::from([((1u32, 7u64), dummy_sub_report())]);
        engine.summarize_one(0, 0, &entry, &generated).await.unwrap();

        let prompt = llm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Sub Report Title"), "force_to_use_sub_communities = true must fold in sub-community summaries regardless of budget");
    }

    #[test]
    fn strip_code_fence_removes_markdown_json_fence() {
        let fenced = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\":1}");
    }
}
