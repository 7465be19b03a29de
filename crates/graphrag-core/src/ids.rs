//! Content-addressed identifiers.
//!
//! Every identifier the pipeline hands out — document, chunk, entity — is
//! derived from a stable hash of the content it names, never from a random
//! UUID. This is what makes re-ingest idempotent (spec.md §8, Invariant 3)
//! and lets two documents with identical bodies still produce distinct
//! chunk IDs (Invariant 1, Scenario C): the chunk hash is scoped to
//! `doc_id::content`, not `content` alone.

use md5::{Digest, Md5};

/// `doc-<H>` where `H` is the MD5 hex digest of `content`.
///
/// MD5 is a deduplication key here, not a security boundary (spec.md §4.2).
pub fn document_id(content: &str) -> String {
    format!("doc-{}", hex_md5(content.as_bytes()))
}

/// `chunk-<H>` where `H` is the MD5 hex digest of `"{doc_id}::{chunk_content}"`.
///
/// Document-scoped so identical text in two different documents never
/// collides (spec.md §3 Chunk, Invariant 1).
pub fn chunk_id(doc_id: &str, chunk_content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(b"::");
    hasher.update(chunk_content.as_bytes());
    format!("chunk-{:x}", hasher.finalize())
}

/// Canonical entity ID: uppercased, quote-stripped name.
///
/// Used consistently as the graph key, the hashed vector-store point key,
/// and the cross-reference used by communities (spec.md §3 Entity).
pub fn canonical_entity_id(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_uppercase()
}

/// Sanitize a label/relation-type token to `[A-Za-z0-9_]+` (spec.md §4.1.3).
///
/// Non-matching characters become `_`; a result that would otherwise be
/// empty falls back to `RELATED`.
pub fn sanitize_label(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let sanitized = sanitized.trim_matches('_').to_string();
    if sanitized.is_empty() {
        "RELATED".to_string()
    } else {
        sanitized.to_uppercase()
    }
}

fn hex_md5(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic 64-bit hash used by vector backends to derive a stable
/// point ID from a caller-provided string ID (spec.md §4.1.2).
///
/// FNV-1a: simple, dependency-free, stable across runs and platforms.
pub fn stable_point_id(ns: &str, id: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in ns.bytes().chain(b"::".iter().copied()).chain(id.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_differ_across_documents_with_identical_content() {
        let a = chunk_id("doc-a", "The quick brown fox.");
        let b = chunk_id("doc-b", "The quick brown fox.");
        assert_ne!(a, b);
    }

    #[test]
    fn chunk_id_deterministic() {
        let a = chunk_id("doc-a", "hello");
        let b = chunk_id("doc-a", "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_entity_id_strips_quotes_and_uppercases() {
        assert_eq!(canonical_entity_id("\"Alice Smith\""), "ALICE SMITH");
        assert_eq!(canonical_entity_id("  bob jones  "), "BOB JONES");
    }

    #[test]
    fn sanitize_label_maps_unsafe_chars_and_falls_back() {
        assert_eq!(sanitize_label("parent of"), "PARENT_OF");
        assert_eq!(sanitize_label("***"), "RELATED");
        assert_eq!(sanitize_label(""), "RELATED");
        assert_eq!(sanitize_label("supersedes"), "SUPERSEDES");
    }

    #[test]
    fn stable_point_id_is_deterministic_and_namespace_scoped() {
        let a = stable_point_id("entities", "ALICE SMITH");
        let b = stable_point_id("entities", "ALICE SMITH");
        let c = stable_point_id("chunks", "ALICE SMITH");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
