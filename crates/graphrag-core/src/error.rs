//! Error taxonomy (spec.md §7).
//!
//! Every failure in the engine is classified into one of six kinds. The
//! classification is what the (out-of-scope) API layer would map to HTTP
//! status codes, and it drives the propagation policy in the ingestion
//! pipeline: `TransientExternal` retries, `PermanentExternal` surfaces,
//! `ContractViolation` fails fast, `DataIntegrity` degrades with a `WARN`
//! log, `Internal` propagates to a top-level handler, `StreamIdle` fails
//! the stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphRagError {
    /// Network timeout, 5xx, or rate-limit from an LLM/embedding/Redis/
    /// Qdrant/Neo4j dependency. Caller policy: retry with backoff.
    #[error("transient external failure: {message}")]
    TransientExternal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 4xx (non-rate-limit), auth failure, or malformed response after
    /// retries are exhausted. Caller policy: surface with context.
    #[error("permanent external failure: {message}")]
    PermanentExternal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Invalid config, invalid backend token, naive mode requested while
    /// disabled, unsupported clustering algorithm. Caller policy: fail
    /// fast at construction or request boundary.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Checksum mismatch on restore, orphan reference during query
    /// assembly, missing entity for an edge. Caller policy: log WARN and
    /// degrade; never crash the query.
    #[error("data integrity issue: {0}")]
    DataIntegrity(String),

    /// Programmer error / assertion failure. Caller policy: propagate.
    #[error("internal error: {0}")]
    Internal(String),

    /// LLM stream chunk exceeded the idle timeout. Caller policy: fail the
    /// stream; caller may retry.
    #[error("stream idle timeout after {idle_secs}s")]
    StreamIdle { idle_secs: u64 },
}

impl GraphRagError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientExternal { message: message.into(), source: None }
    }

    pub fn transient_from(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::TransientExternal { message: message.into(), source: Some(source) }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentExternal { message: message.into(), source: None }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    /// True for failures a caller should retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExternal { .. } | Self::StreamIdle { .. })
    }
}

pub type Result<T> = std::result::Result<T, GraphRagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_stream_idle_are_retryable() {
        assert!(GraphRagError::transient("timeout").is_retryable());
        assert!(GraphRagError::StreamIdle { idle_secs: 30 }.is_retryable());
    }

    #[test]
    fn contract_violations_are_not_retryable() {
        assert!(!GraphRagError::contract("bad config").is_retryable());
        assert!(!GraphRagError::permanent("401").is_retryable());
    }
}
