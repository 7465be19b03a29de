//! # graphrag
//!
//! CLI façade over [`graphrag::ingest`], [`graphrag::community`],
//! [`graphrag::query`], and [`graphrag::backup`]: a thin binary, not the
//! REST/dashboard surface the engine itself stays out of.
//!
//! ```text
//! graphrag init
//! graphrag ingest <dir>
//! graphrag query "<text>" --mode local|global|naive
//! graphrag backup <path>
//! graphrag restore <path>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use graphrag::backup::{self, BackendNames};
use graphrag::community::CommunityEngine;
use graphrag::config::Config;
use graphrag::ingest::IngestEngine;
use graphrag::jobs::JobStore;
use graphrag::llm::{create_embedding_provider, create_llm_provider, CachedLlmProvider, LlmProvider};
use graphrag::query::{QueryEngine, QueryMode};
use graphrag::storage::{create_graph_store, create_kv_store, create_vector_store};

use graphrag_core::models::Document;

#[derive(Parser)]
#[command(name = "graphrag", about = "A local-first RAG engine over a hierarchical knowledge graph", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./graphrag.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and open (or create) the storage backends
    Init,

    /// Ingest every `*.txt`/`*.md` file in a directory
    Ingest {
        /// Directory of documents to ingest
        dir: PathBuf,

        /// Skip community report generation after ingest
        #[arg(long)]
        skip_clustering: bool,
    },

    /// Answer a query against the committed graph/vectors/reports
    Query {
        /// Query text
        text: String,

        /// Query mode
        #[arg(long, default_value = "local")]
        mode: String,

        /// For --mode global: only consider community reports at or below this level
        #[arg(long)]
        max_level: Option<u32>,
    },

    /// Snapshot the working directory into a `.ngbak` bundle
    Backup {
        /// Destination archive path
        path: PathBuf,
    },

    /// Restore a `.ngbak` bundle into the configured working directory
    Restore {
        /// Source archive path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = Config::load(&cli.config, None).with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => run_init(&config).await?,
        Commands::Ingest { dir, skip_clustering } => run_ingest(&config, &dir, skip_clustering).await?,
        Commands::Query { text, mode, max_level } => run_query(&config, &text, &mode, max_level).await?,
        Commands::Backup { path } => run_backup(&config, &path).await?,
        Commands::Restore { path } => run_restore(&config, &path).await?,
    }

    Ok(())
}

/// Installs the global `tracing` subscriber: human-readable by default,
/// JSON lines with `--json-logs` (see `progress.rs`'s module doc for why
/// ingest progress is folded into this same `tracing` stream instead of a
/// separate stderr writer).
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn build_stores(config: &Config) -> Result<(Arc<dyn graphrag_core::store::KvStore>, Arc<dyn graphrag_core::store::VectorStore>, Arc<dyn graphrag_core::store::GraphStore>)> {
    let kv = create_kv_store(&config.storage).await?;
    let vector = create_vector_store(&config.storage).await?;
    let graph = create_graph_store(&config.storage).await?;
    Ok((kv, vector, graph))
}

fn api_key(provider: &str) -> Result<String> {
    let var = format!("{}_API_KEY", provider.to_uppercase());
    std::env::var(&var).with_context(|| format!("{var} must be set for provider '{provider}'"))
}

async fn run_init(config: &Config) -> Result<()> {
    build_stores(config).await?;
    println!("Initialized storage at {}", config.storage.working_dir);
    Ok(())
}

async fn run_ingest(config: &Config, dir: &Path, skip_clustering: bool) -> Result<()> {
    let (kv, vector, graph) = build_stores(config).await?;
    let llm = create_llm_provider(&config.llm, api_key(&config.llm.provider)?)?;
    let llm: Arc<dyn LlmProvider> = Arc::new(CachedLlmProvider::new(llm, kv.clone(), config.llm.model.clone(), config.llm.response_cache_enabled, config.llm.max_concurrent));
    let embeddings = create_embedding_provider(&config.embedding, api_key(&config.embedding.provider)?)?;

    let jobs = JobStore::new(kv.clone(), config.storage.job_ttl_secs);
    let job = jobs.create(Utc::now()).await?;
    jobs.mark_running(&job.job_id, "ingesting", Utc::now()).await?;

    let documents = read_documents(dir)?;

    let engine = IngestEngine::new(kv.clone(), vector.clone(), graph.clone(), llm.clone(), embeddings.clone(), config.clone());
    let summary = match engine.ingest_documents(documents, &job.job_id).await {
        Ok(summary) => summary,
        Err(e) => {
            jobs.mark_failed(&job.job_id, e.to_string(), Utc::now()).await?;
            return Err(e.into());
        }
    };

    let mut report_count = 0;
    if !skip_clustering {
        let community = CommunityEngine::new(graph, vector, kv, llm, embeddings, config.clone());
        let reports = community.cluster_and_summarize(&job.job_id).await?;
        report_count = reports.len();
    }

    jobs.mark_completed(&job.job_id, serde_json::to_value(&summary).unwrap_or_default(), Utc::now()).await?;
    println!(
        "Ingested {} document(s) ({} failed), {} chunk(s), {} entities, {} relationships, {report_count} community report(s). Job {}",
        summary.documents_ingested, summary.documents_failed, summary.chunks_processed, summary.entities_upserted, summary.relationships_upserted, job.job_id
    );
    Ok(())
}

fn read_documents(dir: &Path) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let is_text = matches!(path.extension().and_then(|e| e.to_str()), Some("txt") | Some("md"));
        if !path.is_file() || !is_text {
            continue;
        }
        let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        documents.push(Document { id: Uuid::new_v4().to_string(), content, metadata: serde_json::json!({"path": path.display().to_string()}) });
    }
    Ok(documents)
}

async fn run_query(config: &Config, text: &str, mode: &str, max_level: Option<u32>) -> Result<()> {
    let (kv, vector, graph) = build_stores(config).await?;
    let llm = create_llm_provider(&config.llm, api_key(&config.llm.provider)?)?;
    let llm: Arc<dyn LlmProvider> = Arc::new(CachedLlmProvider::new(llm, kv.clone(), config.llm.model.clone(), config.llm.response_cache_enabled, config.llm.max_concurrent));
    let embeddings = create_embedding_provider(&config.embedding, api_key(&config.embedding.provider)?)?;

    let mode = match mode {
        "local" => QueryMode::Local,
        "global" => QueryMode::Global { max_level },
        "naive" => QueryMode::Naive,
        other => anyhow::bail!("unknown query mode '{other}', expected local, global, or naive"),
    };

    let engine = QueryEngine::new(graph, vector, kv, llm, embeddings, config.clone());
    let answer = engine.query(text, mode).await?;
    println!("{answer}");
    Ok(())
}

async fn run_backup(config: &Config, path: &Path) -> Result<()> {
    let working_dir = PathBuf::from(&config.storage.working_dir);
    let backends = BackendNames { kv: config.storage.kv_backend.clone(), vector: config.storage.vector_backend.clone(), graph: config.storage.graph_backend.clone() };
    backup::create_backup(&working_dir, path, backends).await?;
    println!("Backup written to {}", path.display());
    Ok(())
}

async fn run_restore(config: &Config, path: &Path) -> Result<()> {
    let working_dir = PathBuf::from(&config.storage.working_dir);
    let manifest = backup::restore_backup(path, &working_dir).await?;
    println!("Restored backup {} (engine {})", manifest.backup_id, manifest.engine_version);
    Ok(())
}
