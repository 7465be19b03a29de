//! LLM/embedding provider orchestration (spec.md §4.6).
//!
//! A single provider abstraction — `complete`/`stream_complete` for LLM
//! calls, `embed` for embedding calls — wrapping whichever concrete HTTP
//! API is configured. Every provider is wrapped with the same
//! rate-limiting semaphore, response cache, and retry/backoff policy, the
//! same way the teacher's `embed_openai`/`embed_ollama` retry loop (1s,
//! 2s, 4s, 8s, 16s, 32s backoff, retry on 429/5xx/network error, fail
//! fast on other 4xx) applied uniformly to every embedding backend.

use std::sync::Arc;
use std::time::Duration;

use graphrag_core::error::GraphRagError;
use graphrag_core::store::KvStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, LlmConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, GraphRagError>;

    /// Streams response chunks over an mpsc channel. The receiving end
    /// applies the per-chunk idle timeout (spec.md §4.6) since only the
    /// caller knows how long it's willing to wait between chunks.
    fn stream_complete(&self, prompt: &str, history: &[ChatMessage]) -> mpsc::Receiver<Result<String, GraphRagError>>;
}

#[async_trait::async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GraphRagError>;
}

/// Read a chunk from `rx` with the configured per-chunk idle timeout.
/// Returns `Ok(None)` on a clean end of stream, `Err(StreamIdle)` if the
/// provider stalls longer than `idle_timeout` (spec.md §4.6).
pub async fn recv_with_idle_timeout(
    rx: &mut mpsc::Receiver<Result<String, GraphRagError>>,
    idle_timeout: Duration,
) -> Result<Option<String>, GraphRagError> {
    match tokio::time::timeout(idle_timeout, rx.recv()).await {
        Ok(Some(chunk)) => chunk.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(GraphRagError::StreamIdle { idle_secs: idle_timeout.as_secs() }),
    }
}

/// Retries `f` with the teacher's exponential backoff schedule
/// (1s, 2s, 4s, 8s, 16s, 32s, capped) on [`GraphRagError::is_retryable`].
pub async fn with_retry<T, F, Fut>(max_retries: u32, mut f: F) -> Result<T, GraphRagError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GraphRagError>>,
{
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                warn!(target: "graphrag::llm", attempt, error = %err, "retrying after transient failure");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| GraphRagError::Internal("retry loop exited without a result".to_string())))
}

#[async_trait::async_trait]
impl LlmProvider for Arc<dyn LlmProvider> {
    async fn complete(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, GraphRagError> {
        (**self).complete(prompt, history).await
    }

    fn stream_complete(&self, prompt: &str, history: &[ChatMessage]) -> mpsc::Receiver<Result<String, GraphRagError>> {
        (**self).stream_complete(prompt, history)
    }
}

/// Wraps an [`LlmProvider`] with a KV-backed response cache keyed by a
/// hash of `(model, prompt, params)`. Cache writes happen after a
/// successful call; reads short-circuit the call entirely (spec.md §4.6).
pub struct CachedLlmProvider<P: LlmProvider> {
    inner: P,
    cache: Arc<dyn KvStore>,
    model: String,
    enabled: bool,
    semaphore: Arc<Semaphore>,
}

impl<P: LlmProvider> CachedLlmProvider<P> {
    pub fn new(inner: P, cache: Arc<dyn KvStore>, model: String, enabled: bool, max_concurrent: usize) -> Self {
        Self { inner, cache, model, enabled, semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    fn cache_key(&self, prompt: &str, history: &[ChatMessage]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(prompt.as_bytes());
        for m in history {
            hasher.update(m.role.as_bytes());
            hasher.update(m.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait::async_trait]
impl<P: LlmProvider> LlmProvider for CachedLlmProvider<P> {
    async fn complete(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, GraphRagError> {
        let key = self.cache_key(prompt, history);
        if self.enabled {
            if let Ok(Some(cached)) = self.cache.get("llm_response_cache", &key).await {
                if let Some(text) = cached.as_str() {
                    debug!(target: "graphrag::llm", %key, "response cache hit");
                    return Ok(text.to_string());
                }
            }
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| GraphRagError::Internal(format!("llm semaphore closed: {e}")))?;
        let response = self.inner.complete(prompt, history).await?;
        if self.enabled {
            let _ = self
                .cache
                .upsert("llm_response_cache", std::collections::HashMap::from([(key, serde_json::Value::String(response.clone()))]))
                .await;
        }
        Ok(response)
    }

    fn stream_complete(&self, prompt: &str, history: &[ChatMessage]) -> mpsc::Receiver<Result<String, GraphRagError>> {
        self.inner.stream_complete(prompt, history)
    }
}

/// Calls an OpenAI-compatible chat completions endpoint.
pub struct OpenAiLlmProvider {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
}

impl OpenAiLlmProvider {
    pub fn new(config: LlmConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs)).build()?;
        Ok(Self { client, config, api_key })
    }

    async fn call_once(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, GraphRagError> {
        let mut messages: Vec<serde_json::Value> =
            history.iter().map(|m| serde_json::json!({"role": m.role, "content": m.content})).collect();
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"model": self.config.model, "messages": messages}))
            .send()
            .await
            .map_err(|e| GraphRagError::transient_from("openai request failed", e.into()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(GraphRagError::transient(format!("openai returned {status}")));
        }
        if !status.is_success() {
            return Err(GraphRagError::permanent(format!("openai returned {status}")));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| GraphRagError::permanent(format!("invalid openai response: {e}")))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GraphRagError::permanent("openai response missing choices[0].message.content"))
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn complete(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, GraphRagError> {
        with_retry(self.config.max_retries, || self.call_once(prompt, history)).await
    }

    fn stream_complete(&self, prompt: &str, history: &[ChatMessage]) -> mpsc::Receiver<Result<String, GraphRagError>> {
        // Non-streaming providers can still satisfy the streaming contract
        // by yielding the whole completion as a single chunk.
        let (tx, rx) = mpsc::channel(1);
        let prompt = prompt.to_string();
        let history = history.to_vec();
        let client = self.client.clone();
        let config = self.config.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let provider = OpenAiLlmProvider { client, config, api_key };
            let result = provider.complete(&prompt, &history).await;
            let _ = tx.send(result).await;
        });
        rx
    }
}

/// Calls an OpenAI-compatible embeddings endpoint. Grounded on the
/// teacher's `embed_openai` batching/retry shape.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    config: EmbeddingConfig,
    api_key: String,
    semaphore: Arc<Semaphore>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        let max_concurrent = config.max_concurrent.max(1);
        Ok(Self { client, config, api_key, semaphore: Arc::new(Semaphore::new(max_concurrent)) })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, GraphRagError> {
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"model": self.config.model, "input": batch}))
            .send()
            .await
            .map_err(|e| GraphRagError::transient_from("openai embeddings request failed", e.into()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(GraphRagError::transient(format!("openai embeddings returned {status}")));
        }
        if !status.is_success() {
            return Err(GraphRagError::permanent(format!("openai embeddings returned {status}")));
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| GraphRagError::permanent(format!("invalid embeddings response: {e}")))?;
        body["data"]
            .as_array()
            .ok_or_else(|| GraphRagError::permanent("embeddings response missing data[]"))?
            .iter()
            .map(|entry| {
                entry["embedding"]
                    .as_array()
                    .ok_or_else(|| GraphRagError::permanent("embedding entry missing embedding[]"))?
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| GraphRagError::permanent("non-numeric embedding value")))
                    .collect::<Result<Vec<f32>, _>>()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EmbeddingClient for OpenAiEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GraphRagError> {
        let _permit = self.semaphore.acquire().await.map_err(|e| GraphRagError::Internal(format!("embedding semaphore closed: {e}")))?;
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let batch = batch.to_vec();
            let vectors = with_retry(5, || self.embed_batch(&batch)).await?;
            all.extend(vectors);
        }
        Ok(all)
    }
}

pub fn create_llm_provider(config: &LlmConfig, api_key: String) -> anyhow::Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiLlmProvider::new(config.clone(), api_key)?)),
        other => anyhow::bail!("unsupported llm.provider '{other}'"),
    }
}

pub fn create_embedding_provider(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbeddingProvider::new(config.clone(), api_key)?)),
        other => anyhow::bail!("unsupported embedding.provider '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_retry_retries_transient_and_stops_on_permanent() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), GraphRagError> = with_retry(3, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(GraphRagError::transient("flaky"))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), GraphRagError> = with_retry(5, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(GraphRagError::permanent("nope"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recv_with_idle_timeout_surfaces_stream_idle_error() {
        let (_tx, mut rx) = mpsc::channel::<Result<String, GraphRagError>>(1);
        let result = recv_with_idle_timeout(&mut rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(GraphRagError::StreamIdle { .. })));
    }
}
