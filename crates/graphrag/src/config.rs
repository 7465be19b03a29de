//! Hierarchical, immutable engine configuration (spec.md §6).
//!
//! Loaded from a TOML file, then overridden by environment variables
//! (`GRAPHRAG_<SECTION>_<FIELD>`, uppercased, dotted paths flattened with
//! underscores), then by explicit programmatic overrides passed to
//! [`Config::load`] — that precedence order (programmatic > env >
//! file/default) is the one spec.md §8's Testable Property 8 pins down.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub graph_clustering: GraphClusteringConfig,
    #[serde(default)]
    pub entity_extraction: EntityExtractionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { size: 1200, overlap: 100 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { provider: "openai".to_string(), model: "text-embedding-3-small".to_string(), dims: 1536, batch_size: 32, max_concurrent: 8 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub response_cache_enabled: bool,
    pub max_gleaning: usize,
    pub max_continuation_attempts: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_concurrent: 8,
            max_retries: 5,
            request_timeout_secs: 600,
            stream_idle_timeout_secs: 30,
            response_cache_enabled: true,
            max_gleaning: 1,
            max_continuation_attempts: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub local_top_k: usize,
    pub global_top_k: usize,
    pub naive_top_k: usize,
    pub naive_enabled: bool,
    pub local_max_token_for_text_unit: usize,
    pub local_max_token_for_entity: usize,
    pub local_max_token_for_relationship: usize,
    pub local_max_token_for_report: usize,
    pub global_max_token_for_community_report: usize,
    pub naive_max_token_for_text_unit: usize,
    pub best_model_max_token_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            local_top_k: 20,
            global_top_k: 20,
            naive_top_k: 20,
            naive_enabled: false,
            local_max_token_for_text_unit: 4000,
            local_max_token_for_entity: 2000,
            local_max_token_for_relationship: 2000,
            local_max_token_for_report: 3000,
            global_max_token_for_community_report: 12000,
            naive_max_token_for_text_unit: 4000,
            best_model_max_token_size: 32000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphClusteringConfig {
    pub algorithm: String,
    pub max_cluster_size: usize,
    pub random_seed: u64,
    /// When true, community reports always fold in their sub-communities'
    /// summaries; when false (the default), the sub-community CSV is only
    /// folded in if the community's own entity/relationship context alone
    /// already overruns its token budget (spec.md §4.4).
    pub force_to_use_sub_communities: bool,
}

impl Default for GraphClusteringConfig {
    fn default() -> Self {
        Self { algorithm: "leiden".to_string(), max_cluster_size: 10, random_seed: 0xDEC0DE, force_to_use_sub_communities: false }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EntityExtractionConfig {
    pub entity_types: Vec<String>,
    pub max_entities_per_chunk: usize,
    pub max_edges_per_chunk: usize,
    /// Ordered `(pattern, relation_type)` rules (spec.md §4.3); first
    /// substring match wins, default falls back to `RELATED`.
    pub relation_patterns: Vec<(String, String)>,
}

impl Default for EntityExtractionConfig {
    fn default() -> Self {
        Self {
            entity_types: vec!["PERSON".into(), "ORGANIZATION".into(), "LOCATION".into(), "EVENT".into(), "CONCEPT".into()],
            max_entities_per_chunk: 100,
            max_edges_per_chunk: 100,
            relation_patterns: vec![
                ("supersedes".into(), "SUPERSEDES".into()),
                ("parent of".into(), "PARENT_OF".into()),
                ("works at".into(), "EMPLOYED_BY".into()),
                ("located in".into(), "LOCATED_IN".into()),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub kv_backend: String,
    pub vector_backend: String,
    pub graph_backend: String,
    pub working_dir: String,
    pub batch_size: usize,
    pub job_ttl_secs: u64,
    pub redis: RedisBackendConfig,
    pub qdrant: QdrantBackendConfig,
    pub neo4j: Neo4jBackendConfig,
    pub hybrid_search: HybridSearchConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kv_backend: "json".to_string(),
            vector_backend: "nano".to_string(),
            graph_backend: "networkx".to_string(),
            working_dir: "./graphrag_workdir".to_string(),
            batch_size: 1000,
            job_ttl_secs: 7 * 24 * 3600,
            redis: RedisBackendConfig::default(),
            qdrant: QdrantBackendConfig::default(),
            neo4j: Neo4jBackendConfig::default(),
            hybrid_search: HybridSearchConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RedisBackendConfig {
    pub url: String,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QdrantBackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Neo4jBackendConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub pool_size: usize,
    pub neo4j_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HybridSearchConfig {
    pub enabled: bool,
    pub sparse_model: String,
    pub device: String,
    pub rrf_k: u32,
    pub sparse_top_k_multiplier: f64,
    pub dense_top_k_multiplier: f64,
    pub timeout_seconds: f64,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sparse_model: "splade-cocondenser".to_string(),
            device: "cpu".to_string(),
            rrf_k: 60,
            sparse_top_k_multiplier: 2.0,
            dense_top_k_multiplier: 1.0,
            timeout_seconds: 5.0,
        }
    }
}

const KV_BACKENDS: &[&str] = &["json", "redis"];
const VECTOR_BACKENDS: &[&str] = &["nano", "hnsw", "qdrant"];
const GRAPH_BACKENDS: &[&str] = &["networkx", "neo4j"];

impl Config {
    /// Load from `path`, apply environment-variable overrides, then apply
    /// `programmatic_overrides` (raw TOML fragment merged last), and
    /// validate. Fails fast (`ContractViolation`-flavored `anyhow::bail!`)
    /// on any invalid value rather than deferring to first use.
    pub fn load(path: &Path, programmatic_overrides: Option<&str>) -> Result<Config> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut value: toml::Value = toml::from_str(&content).with_context(|| "failed to parse config file")?;
        apply_env_overrides(&mut value, &[])?;
        if let Some(overrides) = programmatic_overrides {
            let override_value: toml::Value = toml::from_str(overrides).with_context(|| "failed to parse programmatic config overrides")?;
            merge_toml(&mut value, override_value);
        }
        let config: Config = value.try_into().with_context(|| "failed to deserialize merged configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.overlap >= self.chunking.size {
            anyhow::bail!("chunking.overlap ({}) must be smaller than chunking.size ({})", self.chunking.overlap, self.chunking.size);
        }
        if !KV_BACKENDS.contains(&self.storage.kv_backend.as_str()) {
            anyhow::bail!("unknown storage.kv_backend '{}', expected one of {:?}", self.storage.kv_backend, KV_BACKENDS);
        }
        if !VECTOR_BACKENDS.contains(&self.storage.vector_backend.as_str()) {
            anyhow::bail!("unknown storage.vector_backend '{}', expected one of {:?}", self.storage.vector_backend, VECTOR_BACKENDS);
        }
        if !GRAPH_BACKENDS.contains(&self.storage.graph_backend.as_str()) {
            anyhow::bail!("unknown storage.graph_backend '{}', expected one of {:?}", self.storage.graph_backend, GRAPH_BACKENDS);
        }
        if self.storage.kv_backend == "redis" && self.storage.redis.url.is_empty() {
            anyhow::bail!("storage.redis.url must be set when storage.kv_backend = 'redis'");
        }
        if self.storage.vector_backend == "qdrant" && self.storage.qdrant.url.is_empty() {
            anyhow::bail!("storage.qdrant.url must be set when storage.vector_backend = 'qdrant'");
        }
        if self.storage.graph_backend == "neo4j" && self.storage.neo4j.url.is_empty() {
            anyhow::bail!("storage.neo4j.url must be set when storage.graph_backend = 'neo4j'");
        }
        if self.graph_clustering.algorithm != "leiden" {
            anyhow::bail!("unsupported graph_clustering.algorithm '{}': only 'leiden' is implemented", self.graph_clustering.algorithm);
        }
        Ok(())
    }
}

/// Walk every leaf of `value`, and where an env var named
/// `GRAPHRAG_<PATH>` (uppercased, `_`-joined) exists, overwrite the leaf.
fn apply_env_overrides(value: &mut toml::Value, path: &[String]) -> Result<()> {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table.iter_mut() {
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                apply_env_overrides(child, &child_path)?;
            }
        }
        leaf => {
            let var_name = format!("GRAPHRAG_{}", path.join("_").to_uppercase());
            if let Ok(raw) = std::env::var(&var_name) {
                *leaf = env_value_for(leaf, &raw)?;
            }
        }
    }
    Ok(())
}

fn env_value_for(existing: &toml::Value, raw: &str) -> Result<toml::Value> {
    Ok(match existing {
        toml::Value::Integer(_) => toml::Value::Integer(raw.parse().with_context(|| format!("invalid integer override '{raw}'"))?),
        toml::Value::Float(_) => toml::Value::Float(raw.parse().with_context(|| format!("invalid float override '{raw}'"))?),
        toml::Value::Boolean(_) => toml::Value::Boolean(raw.parse().with_context(|| format!("invalid boolean override '{raw}'"))?),
        _ => toml::Value::String(raw.to_string()),
    })
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Flatten a config section to `GRAPHRAG_`-prefixed env var names, used by
/// documentation/tests to enumerate the recognized overrides.
pub fn env_var_name(section: &str, field: &str) -> String {
    format!("GRAPHRAG_{}_{}", section.to_uppercase(), field.to_uppercase())
}

pub type RelationPatternMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn defaults_validate_cleanly() {
        let file = write_temp_config("");
        let config = Config::load(file.path(), None).unwrap();
        assert_eq!(config.chunking.size, 1200);
        assert_eq!(config.storage.kv_backend, "json");
    }

    #[test]
    fn overlap_greater_than_size_is_rejected() {
        let file = write_temp_config("[chunking]\nsize = 100\noverlap = 100\n");
        let err = Config::load(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn unknown_backend_token_is_rejected() {
        let file = write_temp_config("[storage]\nkv_backend = \"dynamodb\"\n");
        let err = Config::load(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("kv_backend"));
    }

    #[test]
    fn programmatic_override_wins_over_environment_variable() {
        std::env::set_var("GRAPHRAG_CHUNKING_SIZE", "500");
        let file = write_temp_config("");
        let config = Config::load(file.path(), Some("[chunking]\nsize = 900\noverlap = 50\n")).unwrap();
        assert_eq!(config.chunking.size, 900);
        std::env::remove_var("GRAPHRAG_CHUNKING_SIZE");
    }

    #[test]
    fn environment_variable_overrides_file_default() {
        std::env::set_var("GRAPHRAG_CHUNKING_SIZE", "800");
        let file = write_temp_config("[chunking]\noverlap = 50\n");
        let config = Config::load(file.path(), None).unwrap();
        assert_eq!(config.chunking.size, 800);
        std::env::remove_var("GRAPHRAG_CHUNKING_SIZE");
    }
}
