//! Local/global/naive query planner (spec.md §4.5).
//!
//! All three modes embed the query, retrieve from one vector namespace,
//! assemble a token-budgeted context, and hand it to the LLM. Local mode
//! additionally walks the graph outward from the retrieved entities;
//! global mode runs a map-reduce over community reports; naive mode
//! skips the graph entirely and answers straight from retrieved chunks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use graphrag_core::chunk::{count_tokens, truncate_to_tokens};
use graphrag_core::context::CsvTable;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::models::{ClusterRef, GRAPH_FIELD_SEP};
use graphrag_core::store::{GraphStore, KvStore, VectorSearchHit, VectorStore};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::llm::{EmbeddingClient, LlmProvider};

const LOCAL_QUERY_PROMPT: &str = "\
Answer the question using the knowledge graph context below. If the \
context is insufficient, say so rather than guessing.

{context}

-----QUESTION-----
{query}
";

const GLOBAL_MAP_PROMPT: &str = "\
You are one of several analysts summarizing community reports from a \
knowledge graph to help answer a question.

-----REPORTS-----
{reports}

-----QUESTION-----
{query}

List every point worth making in your answer. Respond with a JSON array \
of objects, each: {{\"analyst_id\": number, \"description\": string, \
\"score\": number (0-10)}}. Omit points scoring 0.
";

const GLOBAL_REDUCE_PROMPT: &str = "\
Combine the analyst points below into a single answer to the question. \
Ignore points that are irrelevant.

-----POINTS-----
{points}

-----QUESTION-----
{query}
";

const NAIVE_QUERY_PROMPT: &str = "\
Answer the question using only the text excerpts below. If they don't \
contain the answer, say so rather than guessing.

-----TEXT EXCERPTS-----
{context}

-----QUESTION-----
{query}
";

#[derive(Debug, Clone)]
pub enum QueryMode {
    Local,
    /// `max_level` restricts retrieval to community reports at or below
    /// that hierarchical level; `None` means unrestricted.
    Global { max_level: Option<u32> },
    Naive,
}

#[derive(Debug, Deserialize)]
struct MapPoint {
    #[serde(default)]
    analyst_id: Value,
    description: String,
    score: f64,
}

pub struct QueryEngine {
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    kv: Arc<dyn KvStore>,
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: Config,
}

impl QueryEngine {
    pub fn new(graph: Arc<dyn GraphStore>, vector: Arc<dyn VectorStore>, kv: Arc<dyn KvStore>, llm: Arc<dyn LlmProvider>, embeddings: Arc<dyn EmbeddingClient>, config: Config) -> Self {
        Self { graph, vector, kv, llm, embeddings, config }
    }

    pub async fn query(&self, text: &str, mode: QueryMode) -> Result<String> {
        match mode {
            QueryMode::Local => self.local_query(text).await,
            QueryMode::Global { max_level } => self.global_query(text, max_level).await,
            QueryMode::Naive => self.naive_query(text).await,
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embeddings
            .embed(std::slice::from_ref(&text.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GraphRagError::Internal("embedding call returned no vectors".to_string()))
    }

    async fn answer(&self, prompt: &str) -> Result<String> {
        self.llm.complete(prompt, &[]).await
    }

    async fn local_query(&self, query_text: &str) -> Result<String> {
        let query_vec = self.embed_one(query_text).await?;
        let seed_hits = self.vector.query_with_text("entities", query_text, &query_vec, self.config.query.local_top_k).await?;
        if seed_hits.is_empty() {
            return self.answer(&LOCAL_QUERY_PROMPT.replace("{context}", "(no matching entities found)").replace("{query}", query_text)).await;
        }

        let seed_names: Vec<String> = seed_hits.iter().map(|h| h.id.clone()).collect();
        let seed_set: HashSet<&str> = seed_names.iter().map(String::as_str).collect();
        let mut entity_rank: HashMap<String, usize> = seed_names.iter().enumerate().map(|(i, name)| (name.clone(), i)).collect();

        // Expand one hop from every seed, direction preserved.
        let mut edge_pairs: Vec<(String, String)> = Vec::new();
        let mut seen_edges: HashSet<(String, String)> = HashSet::new();
        for name in &seed_names {
            let Some(edges) = self.graph.get_node_edges(name).await? else { continue };
            for pair in edges {
                if seen_edges.insert(pair.clone()) {
                    edge_pairs.push(pair);
                }
            }
        }

        let mut entity_names: Vec<String> = seed_names.clone();
        for (src, tgt) in &edge_pairs {
            for candidate in [src, tgt] {
                if !entity_rank.contains_key(candidate) {
                    entity_rank.insert(candidate.clone(), entity_rank.len());
                    entity_names.push(candidate.clone());
                }
            }
        }

        let node_attrs = self.graph.get_nodes_batch(&entity_names).await?;
        let degrees = self.graph.node_degrees_batch(&entity_names).await?;

        let mut entities = CsvTable::new(vec!["id".into(), "entity".into(), "type".into(), "description".into(), "rank".into()], Some(3));
        let mut rows: Vec<(usize, Vec<String>)> = Vec::new();
        for (i, ((name, attrs), degree)) in entity_names.iter().zip(node_attrs).zip(degrees).enumerate() {
            let Some(attrs) = attrs else {
                warn!(target: "graphrag::query", entity = %name, "entity missing node attrs during local query assembly, skipping");
                continue;
            };
            rows.push((
                degree,
                vec![
                    i.to_string(),
                    name.clone(),
                    attrs.get("entity_type").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string(),
                    attrs.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
                    degree.to_string(),
                ],
            ));
        }
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, row) in rows {
            entities.push_row(row);
        }

        let edge_attrs = self.graph.get_edges_batch(&edge_pairs).await?;
        let edge_degrees = self.graph.edge_degrees_batch(&edge_pairs).await?;
        let mut ranked_edges: Vec<(bool, f64, Vec<String>)> = Vec::new();
        for (i, (((src, tgt), attrs), degree)) in edge_pairs.iter().zip(edge_attrs).zip(edge_degrees).enumerate() {
            let Some(attrs) = attrs else {
                warn!(target: "graphrag::query", %src, %tgt, "edge missing attrs during local query assembly, skipping");
                continue;
            };
            let both_seeds = seed_set.contains(src.as_str()) && seed_set.contains(tgt.as_str());
            let weight = attrs.get("weight").and_then(Value::as_f64).unwrap_or(0.0);
            ranked_edges.push((
                both_seeds,
                weight,
                vec![
                    i.to_string(),
                    src.clone(),
                    tgt.clone(),
                    attrs.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
                    attrs.get("relation_type").and_then(Value::as_str).unwrap_or("RELATED").to_string(),
                    weight.to_string(),
                    degree.to_string(),
                ],
            ));
        }
        ranked_edges.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)));
        let mut relationships = CsvTable::new(vec!["id".into(), "source".into(), "target".into(), "description".into(), "relation_type".into(), "weight".into(), "rank".into()], Some(3));
        for (_, _, row) in ranked_edges {
            relationships.push_row(row);
        }

        let mut sources = self.select_text_units(&entity_names, &entity_rank).await?;
        let mut reports = self.select_community_reports(&entity_names).await?;

        entities.fit_to_budget(self.config.query.local_max_token_for_entity);
        relationships.fit_to_budget(self.config.query.local_max_token_for_relationship);
        sources.fit_to_budget(self.config.query.local_max_token_for_text_unit);
        reports.fit_to_budget(self.config.query.local_max_token_for_report);

        let context = graphrag_core::context::assemble_sections(&[("REPORTS", &reports), ("ENTITIES", &entities), ("RELATIONSHIPS", &relationships), ("SOURCES", &sources)]);
        self.answer(&LOCAL_QUERY_PROMPT.replace("{context}", &context).replace("{query}", query_text)).await
    }

    /// Selects chunks referenced by `entity_names`, ordered by the
    /// referencing entity's rank, then by how many surviving entities
    /// share that chunk (spec.md §4.5.1 step 5).
    async fn select_text_units(&self, entity_names: &[String], entity_rank: &HashMap<String, usize>) -> Result<CsvTable> {
        let node_attrs = self.graph.get_nodes_batch(entity_names).await?;
        let mut best_rank: HashMap<String, usize> = HashMap::new();
        let mut occurrence: HashMap<String, usize> = HashMap::new();
        for (name, attrs) in entity_names.iter().zip(node_attrs) {
            let Some(attrs) = attrs else { continue };
            let Some(source_id) = attrs.get("source_id").and_then(Value::as_str) else { continue };
            let rank = *entity_rank.get(name).unwrap_or(&usize::MAX);
            for chunk_id in source_id.split(GRAPH_FIELD_SEP).filter(|s| !s.is_empty()) {
                occurrence.entry(chunk_id.to_string()).and_modify(|c| *c += 1).or_insert(1);
                best_rank.entry(chunk_id.to_string()).and_modify(|r| *r = (*r).min(rank)).or_insert(rank);
            }
        }

        let mut ordered: Vec<String> = best_rank.keys().cloned().collect();
        ordered.sort_by(|a, b| best_rank[a].cmp(&best_rank[b]).then(occurrence[b].cmp(&occurrence[a])));

        let mut table = CsvTable::new(vec!["id".into(), "content".into()], Some(1));
        for (i, chunk_id) in ordered.iter().enumerate() {
            match self.kv.get("text_chunks", chunk_id).await? {
                Some(record) => {
                    let content = record.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
                    table.push_row(vec![i.to_string(), content]);
                }
                None => warn!(target: "graphrag::query", %chunk_id, "text unit referenced by an entity is missing from text_chunks"),
            }
        }
        Ok(table)
    }

    /// Selects community reports whose membership intersects the
    /// surviving entity set, weighted by report rating and membership
    /// overlap count (spec.md §4.5.1 step 6).
    async fn select_community_reports(&self, entity_names: &[String]) -> Result<CsvTable> {
        let node_attrs = self.graph.get_nodes_batch(entity_names).await?;
        let mut overlap: HashMap<String, usize> = HashMap::new();
        for attrs in node_attrs.into_iter().flatten() {
            let Some(clusters_value) = attrs.get("clusters") else { continue };
            let Ok(clusters) = serde_json::from_value::<Vec<ClusterRef>>(clusters_value.clone()) else { continue };
            for c in clusters {
                let key = format!("{}-{}", c.level, c.cluster_id);
                overlap.entry(key).and_modify(|n| *n += 1).or_insert(1);
            }
        }

        let mut weighted: Vec<(f64, String, String, String, f64)> = Vec::new();
        for (key, count) in &overlap {
            let Some(record) = self.kv.get("community_reports", key).await? else { continue };
            let title = record.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
            let summary = record.get("summary").and_then(Value::as_str).unwrap_or_default().to_string();
            let rating = record.get("rating").and_then(Value::as_f64).unwrap_or(0.0);
            weighted.push((rating * (*count as f64), key.clone(), title, summary, rating));
        }
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut table = CsvTable::new(vec!["id".into(), "title".into(), "summary".into(), "rating".into()], Some(2));
        for (i, (_, _, title, summary, rating)) in weighted.into_iter().enumerate() {
            table.push_row(vec![i.to_string(), title, summary, rating.to_string()]);
        }
        Ok(table)
    }

    async fn global_query(&self, query_text: &str, max_level: Option<u32>) -> Result<String> {
        let query_vec = self.embed_one(query_text).await?;
        let hits = self.vector.query_with_text("community_reports", query_text, &query_vec, self.config.query.global_top_k).await?;
        let filtered: Vec<VectorSearchHit> = hits
            .into_iter()
            .filter(|h| match max_level {
                None => true,
                Some(limit) => h.extra_payload.get("level").and_then(Value::as_u64).map(|l| l <= limit as u64).unwrap_or(true),
            })
            .collect();
        if filtered.is_empty() {
            return self.answer(&GLOBAL_REDUCE_PROMPT.replace("{points}", "(no relevant community reports found)").replace("{query}", query_text)).await;
        }

        let budget = self.config.query.global_max_token_for_community_report;
        let batches = partition_by_token_budget(&filtered, budget);

        let mut points: Vec<MapPoint> = Vec::new();
        for batch in &batches {
            let mut table = CsvTable::new(vec!["id".into(), "report".into(), "rating".into()], Some(1));
            for (i, hit) in batch.iter().enumerate() {
                let rating = hit.extra_payload.get("rating").and_then(Value::as_f64).unwrap_or(0.0);
                table.push_row(vec![i.to_string(), hit.content.clone(), rating.to_string()]);
            }
            let prompt = GLOBAL_MAP_PROMPT.replace("{reports}", &table.render()).replace("{query}", query_text);
            let raw = self.llm.complete(&prompt, &[]).await?;
            match parse_map_points(&raw) {
                Ok(batch_points) => points.extend(batch_points.into_iter().filter(|p| p.score > 0.0)),
                Err(err) => warn!(target: "graphrag::query", error = %err, "map phase response was not parseable, skipping batch"),
            }
        }

        points.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut table = CsvTable::new(vec!["id".into(), "analyst".into(), "description".into(), "score".into()], Some(2));
        for (i, p) in points.iter().enumerate() {
            table.push_row(vec![i.to_string(), analyst_id_string(&p.analyst_id), p.description.clone(), p.score.to_string()]);
        }
        table.fit_to_budget(budget);

        self.answer(&GLOBAL_REDUCE_PROMPT.replace("{points}", &table.render()).replace("{query}", query_text)).await
    }

    async fn naive_query(&self, query_text: &str) -> Result<String> {
        if !self.config.query.naive_enabled {
            return Err(GraphRagError::contract("naive query mode is disabled (query.naive_enabled = false)"));
        }
        let query_vec = self.embed_one(query_text).await?;
        let hits = self.vector.query_with_text("chunks", query_text, &query_vec, self.config.query.naive_top_k).await?;
        if hits.is_empty() {
            return self.answer(&NAIVE_QUERY_PROMPT.replace("{context}", "(no matching text found)").replace("{query}", query_text)).await;
        }
        let concatenated = hits.iter().map(|h| h.content.as_str()).collect::<Vec<_>>().join("\n\n");
        let truncated = truncate_to_tokens(&concatenated, self.config.query.naive_max_token_for_text_unit);
        self.answer(&NAIVE_QUERY_PROMPT.replace("{context}", &truncated).replace("{query}", query_text)).await
    }
}

fn analyst_id_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Greedily fills batches up to `budget` tokens, never splitting a
/// single report across batches (spec.md §4.5.2 step 2).
fn partition_by_token_budget(hits: &[VectorSearchHit], budget: usize) -> Vec<Vec<VectorSearchHit>> {
    let mut batches = Vec::new();
    let mut current: Vec<VectorSearchHit> = Vec::new();
    let mut current_tokens = 0usize;
    for hit in hits {
        let tokens = count_tokens(&hit.content);
        if !current.is_empty() && current_tokens + tokens > budget {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(hit.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Parses the map phase's JSON array, tolerating a markdown code fence or
/// leading/trailing prose by trying the substring between the first `[`
/// and the last `]` before giving up (spec.md §4.5.2 step 4).
fn parse_map_points(raw: &str) -> std::result::Result<Vec<MapPoint>, serde_json::Error> {
    let trimmed = raw.trim();
    if let Ok(points) = serde_json::from_str(trimmed) {
        return Ok(points);
    }
    match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&trimmed[start..=end]),
        _ => serde_json::from_str(trimmed),
    }
}
