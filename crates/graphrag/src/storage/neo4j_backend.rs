//! Neo4j + Graph Data Science graph backend (`storage.graph_backend =
//! "neo4j"`, spec.md §4.1.3). Every entity is a node labeled with the
//! sanitized working-directory namespace; every relationship is stored
//! as a uniform `RELATED` edge type carrying a `relation_type` property,
//! keeping the Cypher schema bounded while preserving the full set of
//! semantic relation types spec.md §3 requires.

use std::collections::HashMap;

use async_trait::async_trait;
use graphrag_core::error::{GraphRagError, Result};
use graphrag_core::models::GRAPH_FIELD_SEP;
use graphrag_core::store::graph::{CommunitySchemaEntry, EdgeAttrs, GraphBatch, NodeAttrs};
use graphrag_core::store::GraphStore;
use neo4rs::{query, ConfigBuilder, Graph};
use serde_json::Value;

use crate::config::Neo4jBackendConfig;

fn sanitize_namespace(raw: &str) -> String {
    let cleaned: String = raw.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    if cleaned.is_empty() {
        "Entity".to_string()
    } else {
        cleaned
    }
}

fn new_community_entry(level: u32, cluster_id: i64) -> CommunitySchemaEntry {
    CommunitySchemaEntry { level, title: format!("Community {cluster_id}"), edges: Vec::new(), nodes: Vec::new(), sub_communities: Vec::new(), occurrence: 0.0, chunk_ids: Vec::new() }
}

fn attrs_to_params(attrs: &HashMap<String, Value>) -> HashMap<String, neo4rs::BoltType> {
    attrs
        .iter()
        .filter_map(|(k, v)| json_to_bolt(v).map(|b| (k.clone(), b)))
        .collect()
}

fn json_to_bolt(value: &Value) -> Option<neo4rs::BoltType> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(neo4rs::BoltType::Boolean(neo4rs::BoltBoolean::new(*b))),
        Value::Number(n) => n.as_f64().map(|f| neo4rs::BoltType::Float(neo4rs::BoltFloat::new(f))),
        Value::String(s) => Some(neo4rs::BoltType::String(neo4rs::BoltString::new(s))),
        other => Some(neo4rs::BoltType::String(neo4rs::BoltString::new(&other.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_namespace_replaces_non_alphanumeric_and_falls_back() {
        assert_eq!(sanitize_namespace("my-graph.db"), "my_graph_db");
        assert_eq!(sanitize_namespace(""), "Entity");
        assert_eq!(sanitize_namespace("***"), "___");
    }

    #[test]
    fn json_to_bolt_drops_null_and_preserves_scalars() {
        assert!(json_to_bolt(&Value::Null).is_none());
        assert!(matches!(json_to_bolt(&Value::Bool(true)), Some(neo4rs::BoltType::Boolean(_))));
        assert!(matches!(json_to_bolt(&Value::String("x".to_string())), Some(neo4rs::BoltType::String(_))));
        assert!(matches!(json_to_bolt(&serde_json::json!(1.5)), Some(neo4rs::BoltType::Float(_))));
    }
}

pub struct Neo4jGraphStore {
    graph: Graph,
    label: String,
}

impl Neo4jGraphStore {
    pub async fn connect(config: &Neo4jBackendConfig) -> anyhow::Result<Self> {
        let neo4j_config = ConfigBuilder::default()
            .uri(&config.url)
            .user(&config.username)
            .password(&config.password)
            .db(config.database.clone())
            .max_connections(config.pool_size.max(1))
            .build()?;
        let graph = Graph::connect(neo4j_config).await?;
        let label = sanitize_namespace(&config.database);
        let store = Self { graph, label };
        store.ensure_constraints().await?;
        Ok(store)
    }

    async fn ensure_constraints(&self) -> anyhow::Result<()> {
        self.graph
            .run(query(&format!("CREATE CONSTRAINT IF NOT EXISTS FOR (n:{}) REQUIRE n.id IS UNIQUE", self.label)))
            .await?;
        for field in ["entity_type", "source_id", "clusters"] {
            self.graph
                .run(query(&format!("CREATE INDEX IF NOT EXISTS FOR (n:{}) ON (n.{field})", self.label)))
                .await?;
        }
        Ok(())
    }

    fn to_transient(err: neo4rs::Error) -> GraphRagError {
        GraphRagError::transient_from("neo4j query failed", err.into())
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn has_node(&self, id: &str) -> Result<bool> {
        Ok(self.get_node(id).await?.is_some())
    }

    async fn has_edge(&self, src: &str, tgt: &str) -> Result<bool> {
        Ok(self.get_edge(src, tgt).await?.is_some())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>> {
        let q = query(&format!("MATCH (n:{}) WHERE n.id = $id RETURN properties(n) AS p", self.label)).param("id", id);
        let mut result = self.graph.execute(q).await.map_err(Self::to_transient)?;
        if let Some(row) = result.next().await.map_err(Self::to_transient)? {
            let props: HashMap<String, String> = row.get("p").unwrap_or_default();
            Ok(Some(props.into_iter().map(|(k, v)| (k, Value::String(v))).collect()))
        } else {
            Ok(None)
        }
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeAttrs>> {
        let q = query(&format!("MATCH (s:{lbl} {{id: $src}})-[r:RELATED]->(t:{lbl} {{id: $tgt}}) RETURN properties(r) AS p", lbl = self.label))
            .param("src", src)
            .param("tgt", tgt);
        let mut result = self.graph.execute(q).await.map_err(Self::to_transient)?;
        if let Some(row) = result.next().await.map_err(Self::to_transient)? {
            let props: HashMap<String, String> = row.get("p").unwrap_or_default();
            Ok(Some(props.into_iter().map(|(k, v)| (k, Value::String(v))).collect()))
        } else {
            Ok(None)
        }
    }

    async fn get_nodes_batch(&self, ids: &[String]) -> Result<Vec<Option<NodeAttrs>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_node(id).await?);
        }
        Ok(out)
    }

    async fn get_edges_batch(&self, pairs: &[(String, String)]) -> Result<Vec<Option<EdgeAttrs>>> {
        let mut out = Vec::with_capacity(pairs.len());
        for (src, tgt) in pairs {
            out.push(self.get_edge(src, tgt).await?);
        }
        Ok(out)
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        let q = query(&format!("MATCH (n:{} {{id: $id}})-[r]-() RETURN count(r) AS c", self.label)).param("id", id);
        let mut result = self.graph.execute(q).await.map_err(Self::to_transient)?;
        if let Some(row) = result.next().await.map_err(Self::to_transient)? {
            Ok(row.get::<i64>("c").unwrap_or(0) as usize)
        } else {
            Ok(0)
        }
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.node_degree(id).await?);
        }
        Ok(out)
    }

    async fn edge_degree(&self, src: &str, tgt: &str) -> Result<usize> {
        Ok(self.node_degree(src).await? + self.node_degree(tgt).await?)
    }

    async fn edge_degrees_batch(&self, pairs: &[(String, String)]) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(pairs.len());
        for (src, tgt) in pairs {
            out.push(self.edge_degree(src, tgt).await?);
        }
        Ok(out)
    }

    async fn get_node_edges(&self, id: &str) -> Result<Option<Vec<(String, String)>>> {
        if !self.has_node(id).await? {
            return Ok(None);
        }
        let q = query(&format!("MATCH (s:{lbl} {{id: $id}})-[:RELATED]->(t:{lbl}) RETURN t.id AS tid", lbl = self.label)).param("id", id);
        let mut result = self.graph.execute(q).await.map_err(Self::to_transient)?;
        let mut edges = Vec::new();
        while let Some(row) = result.next().await.map_err(Self::to_transient)? {
            if let Ok(tid) = row.get::<String>("tid") {
                edges.push((id.to_string(), tid));
            }
        }
        Ok(Some(edges))
    }

    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()> {
        self.upsert_nodes_batch(vec![(id.to_string(), attrs)]).await
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, attrs: EdgeAttrs) -> Result<()> {
        self.upsert_edges_batch(vec![(src.to_string(), tgt.to_string(), attrs)]).await
    }

    async fn upsert_nodes_batch(&self, nodes: Vec<(String, NodeAttrs)>) -> Result<()> {
        for (id, attrs) in nodes {
            let q = query(&format!("MERGE (n:{} {{id: $id}}) SET n += $data", self.label))
                .param("id", id.as_str())
                .param("data", attrs_to_params(&attrs));
            self.graph.run(q).await.map_err(Self::to_transient)?;
        }
        Ok(())
    }

    async fn upsert_edges_batch(&self, edges: Vec<(String, String, EdgeAttrs)>) -> Result<()> {
        for (src, tgt, attrs) in edges {
            let relation_type = attrs.get("relation_type").and_then(|v| v.as_str()).unwrap_or("RELATED").to_string();
            let q = query(&format!(
                "MATCH (s:{lbl} {{id: $src}}), (t:{lbl} {{id: $tgt}}) MERGE (s)-[r:RELATED]->(t) SET r += $data, r.relation_type = $relation_type",
                lbl = self.label
            ))
            .param("src", src.as_str())
            .param("tgt", tgt.as_str())
            .param("data", attrs_to_params(&attrs))
            .param("relation_type", relation_type);
            self.graph.run(q).await.map_err(Self::to_transient)?;
        }
        Ok(())
    }

    /// Applies the already-merged document payload directly — the merge
    /// happened in application code, so this assigns rather than
    /// re-aggregating (spec.md §4.1.3 Neo4j backend contract).
    async fn execute_document_batch(&self, batch: GraphBatch) -> Result<()> {
        let mut txn = self.graph.start_txn().await.map_err(Self::to_transient)?;
        for (id, attrs) in &batch.nodes {
            let q = query(&format!("MERGE (n:{} {{id: $id}}) SET n += $data", self.label))
                .param("id", id.as_str())
                .param("data", attrs_to_params(attrs));
            txn.run(q).await.map_err(Self::to_transient)?;
        }
        for (src, tgt, attrs) in &batch.edges {
            let relation_type = attrs.get("relation_type").and_then(|v| v.as_str()).unwrap_or("RELATED").to_string();
            let q = query(&format!(
                "MATCH (s:{lbl} {{id: $src}}), (t:{lbl} {{id: $tgt}}) MERGE (s)-[r:RELATED]->(t) SET r += $data, r.relation_type = $relation_type",
                lbl = self.label
            ))
            .param("src", src.as_str())
            .param("tgt", tgt.as_str())
            .param("data", attrs_to_params(attrs))
            .param("relation_type", relation_type);
            txn.run(q).await.map_err(Self::to_transient)?;
        }
        txn.commit().await.map_err(Self::to_transient)
    }

    /// Idempotent GDS projection: drop any stale projection, project,
    /// run Leiden, write community IDs back, drop the projection again
    /// (spec.md §4.1.3 Neo4j backend contract).
    async fn cluster(&self, max_cluster_size: usize, random_seed: u64) -> Result<()> {
        let graph_name = format!("{}_projection", self.label);
        let exists_q = query("CALL gds.graph.exists($name) YIELD exists").param("name", graph_name.as_str());
        let mut result = self.graph.execute(exists_q).await.map_err(Self::to_transient)?;
        let exists = result.next().await.map_err(Self::to_transient)?.and_then(|r| r.get::<bool>("exists").ok()).unwrap_or(false);
        if exists {
            self.graph.run(query("CALL gds.graph.drop($name)").param("name", graph_name.as_str())).await.map_err(Self::to_transient)?;
        }
        self.graph
            .run(
                query(&format!("CALL gds.graph.project($name, '{}', 'RELATED')", self.label))
                    .param("name", graph_name.as_str()),
            )
            .await
            .map_err(Self::to_transient)?;
        let leiden = self
            .graph
            .run(
                query("CALL gds.leiden.write($name, {writeProperty: 'community_id', includeIntermediateCommunities: true, maxLevels: $levels, randomSeed: $seed})")
                    .param("name", graph_name.as_str())
                    .param("levels", max_cluster_size as i64)
                    .param("seed", random_seed as i64),
            )
            .await;
        self.graph.run(query("CALL gds.graph.drop($name)").param("name", graph_name.as_str())).await.map_err(Self::to_transient)?;
        leiden.map_err(Self::to_transient)
    }

    /// `n.community_id` is written by `cluster()` with
    /// `includeIntermediateCommunities: true`, so it is a list ordered
    /// coarsest-first: `cid[0]` is the level-0 id, `cid[1]` (if present) is
    /// its level-1 child. This mirrors the in-memory backend's
    /// level0/level1 split so `community_schema()`'s contract — member
    /// nodes, internal edges, sub-communities, occurrence, and the union of
    /// backing chunk ids — holds the same way on both backends.
    async fn community_schema(&self) -> Result<HashMap<String, CommunitySchemaEntry>> {
        let q = query(&format!(
            "MATCH (n:{}) WHERE n.community_id IS NOT NULL RETURN n.id AS id, n.community_id AS cid, n.source_id AS source_id",
            self.label
        ));
        let mut result = self.graph.execute(q).await.map_err(Self::to_transient)?;
        let mut schema: HashMap<String, CommunitySchemaEntry> = HashMap::new();
        let mut child_of_level0: HashMap<i64, i64> = HashMap::new();
        while let Some(row) = result.next().await.map_err(Self::to_transient)? {
            let Ok(id) = row.get::<String>("id") else { continue };
            let levels: Vec<i64> = row.get::<Vec<i64>>("cid").unwrap_or_else(|_| row.get::<i64>("cid").into_iter().collect());
            let Some(&level0_id) = levels.first() else { continue };
            let source_id = row.get::<String>("source_id").ok();

            let level0_key = format!("0-{level0_id}");
            let entry = schema.entry(level0_key).or_insert_with(|| new_community_entry(0, level0_id));
            entry.nodes.push(id.clone());
            if let Some(src) = &source_id {
                entry.chunk_ids.extend(src.split(GRAPH_FIELD_SEP).filter(|s| !s.is_empty()).map(str::to_string));
            }

            if let Some(&level1_id) = levels.get(1) {
                child_of_level0.insert(level1_id, level0_id);
                let level1_key = format!("1-{level1_id}");
                let entry = schema.entry(level1_key).or_insert_with(|| new_community_entry(1, level1_id));
                entry.nodes.push(id);
                if let Some(src) = &source_id {
                    entry.chunk_ids.extend(src.split(GRAPH_FIELD_SEP).filter(|s| !s.is_empty()).map(str::to_string));
                }
            }
        }
        for entry in schema.values_mut() {
            entry.occurrence = entry.nodes.len() as f64;
            entry.chunk_ids.sort();
            entry.chunk_ids.dedup();
            for node in entry.nodes.clone() {
                if let Some(edges) = self.get_node_edges(&node).await? {
                    entry.edges.extend(edges);
                }
            }
        }
        for (level1_id, level0_id) in child_of_level0 {
            if let Some(parent) = schema.get_mut(&format!("0-{level0_id}")) {
                parent.sub_communities.push(level1_id as u64);
            }
        }
        for entry in schema.values_mut() {
            entry.sub_communities.sort();
            entry.sub_communities.dedup();
        }
        Ok(schema)
    }

    async fn drop_all(&self) -> Result<()> {
        self.graph.run(query(&format!("MATCH (n:{}) DETACH DELETE n", self.label))).await.map_err(Self::to_transient)
    }

    async fn index_done(&self) -> Result<()> {
        Ok(())
    }
}
