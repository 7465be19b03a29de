//! Token-based sliding-window chunker (spec.md §4.2).
//!
//! Splits document content into overlapping, fixed-size token windows
//! rather than paragraph boundaries: entity extraction wants a stable,
//! predictable context length per LLM call, and overlap keeps an entity
//! mentioned at a window edge from losing its surrounding context.
//!
//! # Algorithm
//!
//! 1. Tokenize the full document with `cl100k_base`.
//! 2. Walk the token stream in windows of `size` tokens, advancing by
//!    `size - overlap` each step. The final window may be shorter than
//!    `size`.
//! 3. Detokenize each window back to text.
//! 4. Chunk ID is `chunk-<md5("{doc_id}::{chunk_content}")>` (see
//!    [`crate::ids::chunk_id`]), so identical content in two documents
//!    never collides.
//!
//! # Example
//!
//! ```rust
//! use graphrag_core::chunk::chunk_document;
//!
//! let chunks = chunk_document("doc-123", "Hello world. Second paragraph.", 700, 50).unwrap();
//! assert_eq!(chunks[0].chunk_order_index, 0);
//! ```

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::error::{GraphRagError, Result};
use crate::ids::chunk_id;
use crate::models::Chunk;

fn bpe() -> CoreBPE {
    cl100k_base().expect("cl100k_base ranks are statically embedded and always load")
}

/// Split `content` into overlapping token windows of `size` tokens with
/// `overlap` tokens shared between consecutive windows.
///
/// Returns `ContractViolation` if `overlap >= size` (spec.md §4.2 Invariant).
pub fn chunk_document(doc_id: &str, content: &str, size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    if overlap >= size {
        return Err(GraphRagError::contract(format!(
            "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
        )));
    }
    if size == 0 {
        return Err(GraphRagError::contract("chunk size must be non-zero"));
    }

    let bpe = bpe();
    let tokens = bpe.encode_with_special_tokens(content);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let stride = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut order = 0i64;
    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        let window = &tokens[start..end];
        let text = bpe
            .decode(window.to_vec())
            .map_err(|e| GraphRagError::Internal(format!("token decode failed: {e}")))?;
        chunks.push(Chunk {
            id: chunk_id(doc_id, &text),
            full_doc_id: doc_id.to_string(),
            chunk_order_index: order,
            tokens: window.len(),
            content: text,
        });
        order += 1;
        if end == tokens.len() {
            break;
        }
        start += stride;
    }
    Ok(chunks)
}

/// Split `content` on literal separator strings rather than a fixed token
/// window. Backward-compatible alias for callers that configure a custom
/// text splitter instead of the default sliding window (spec.md §4.2).
pub fn by_separators(doc_id: &str, content: &str, separators: &[&str], size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    if separators.is_empty() {
        return chunk_document(doc_id, content, size, overlap);
    }
    let mut pieces = vec![content.to_string()];
    for sep in separators {
        pieces = pieces
            .into_iter()
            .flat_map(|piece| piece.split(sep).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }
    let joined = pieces
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    chunk_document(doc_id, &joined, size, overlap)
}

/// Token count of `text` under the same tokenizer the chunker uses.
///
/// Shared by the context-assembly budgeting code in [`crate::context`] so
/// the "tokens" a query planner counts match what the chunker produced.
pub fn count_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

/// Truncate `text` to at most `max_tokens` tokens, cutting at a token
/// boundary rather than a byte boundary. Used by the query planner to
/// enforce per-section token budgets (spec.md §4.5).
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let bpe = bpe();
    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return text.to_string();
    }
    bpe.decode(tokens[..max_tokens].to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = chunk_document("doc-a", "hello world", 10, 10).unwrap_err();
        assert!(matches!(err, GraphRagError::ContractViolation(_)));
    }

    #[test]
    fn empty_document_produces_no_chunks() {
        let chunks = chunk_document("doc-a", "", 100, 10).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_order_is_contiguous() {
        let text = "word ".repeat(500);
        let chunks = chunk_document("doc-a", &text, 100, 10).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_order_index, i as i64);
        }
        assert!(chunks.len() > 1);
    }

    #[test]
    fn final_chunk_may_be_shorter_than_size() {
        let text = "word ".repeat(50);
        let chunks = chunk_document("doc-a", &text, 100, 10).unwrap();
        let last = chunks.last().unwrap();
        assert!(last.tokens <= 100);
    }

    #[test]
    fn identical_content_in_two_documents_differs_in_chunk_id() {
        let a = chunk_document("doc-a", "repeated content here", 100, 10).unwrap();
        let b = chunk_document("doc-b", "repeated content here", 100, 10).unwrap();
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn chunking_is_deterministic() {
        let a = chunk_document("doc-a", "some stable text to chunk", 100, 10).unwrap();
        let b = chunk_document("doc-a", "some stable text to chunk", 100, 10).unwrap();
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn truncate_to_tokens_is_a_no_op_under_budget() {
        let text = "hello world";
        assert_eq!(truncate_to_tokens(text, 100), text);
    }

    #[test]
    fn truncate_to_tokens_shortens_over_budget_text() {
        let text = "word ".repeat(200);
        let truncated = truncate_to_tokens(&text, 10);
        assert!(count_tokens(&truncated) <= 10);
        assert!(truncated.len() < text.len());
    }

    #[test]
    fn by_separators_splits_on_configured_delimiter() {
        let chunks = by_separators("doc-a", "first::second::third", &["::"], 1000, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("first"));
        assert!(chunks[0].content.contains("third"));
    }
}
