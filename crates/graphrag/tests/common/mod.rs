//! Shared test doubles for the scenario tests in this directory, mirroring
//! the `ScriptedLlm`/`StubEmbeddings` pattern used in `ingest.rs`'s,
//! `community.rs`'s, and `query.rs`'s own `#[cfg(test)]` modules.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use graphrag::llm::{ChatMessage, EmbeddingClient, LlmProvider};
use graphrag_core::error::GraphRagError;
use graphrag_core::extraction::{COMPLETION_DELIMITER, RECORD_DELIMITER, TUPLE_DELIMITER};
use tokio::sync::mpsc;

/// Replays a fixed queue of LLM completions, one per call; once exhausted,
/// every further call returns an empty string (a harmless "nothing more to
/// glean" response in the gleaning/continuation loops).
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self { responses: Mutex::new(responses.into_iter().map(str::to_string).collect()) }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String, GraphRagError> {
        Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn stream_complete(&self, _prompt: &str, _history: &[ChatMessage]) -> mpsc::Receiver<Result<String, GraphRagError>> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

/// Every text embeds to the same fixed vector — good enough for tests that
/// only need retrieval to return "everything in the namespace", not to
/// discriminate between candidates by content.
pub struct StubEmbeddings;

#[async_trait]
impl EmbeddingClient for StubEmbeddings {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GraphRagError> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Builds one extraction-style LLM response in the tuple-delimited wire
/// format `extract_chunk` parses, terminated by the completion marker.
pub fn extraction_response(entities: &[(&str, &str, &str)], relationships: &[(&str, &str, &str, f64)]) -> String {
    let mut out = String::new();
    for (name, entity_type, description) in entities {
        out.push_str(&format!("(\"entity\"{TUPLE_DELIMITER}\"{name}\"{TUPLE_DELIMITER}{entity_type}{TUPLE_DELIMITER}{description}){RECORD_DELIMITER}"));
    }
    for (src, tgt, description, weight) in relationships {
        out.push_str(&format!(
            "(\"relationship\"{TUPLE_DELIMITER}\"{src}\"{TUPLE_DELIMITER}\"{tgt}\"{TUPLE_DELIMITER}{description}{TUPLE_DELIMITER}{weight}){RECORD_DELIMITER}"
        ));
    }
    out.push_str(COMPLETION_DELIMITER);
    out
}
