//! Extraction record types, tuple-delimited parsing, and per-document
//! merge logic (spec.md §4.3).
//!
//! The LLM is asked for tuple-delimited records, one per extracted entity
//! or relationship, separated by a literal record-separator string. This
//! module owns parsing that wire format and the pure, store-independent
//! merge step that turns many chunks' worth of records into one
//! [`crate::models::Entity`]/[`crate::models::Relationship`] set per
//! document. Everything here is synchronous and has no I/O: the
//! `graphrag` app crate drives the LLM calls (gleaning, continuation,
//! retries) and hands this module the raw text.

use std::collections::{BTreeSet, HashMap};

use crate::ids::{canonical_entity_id, sanitize_label};
use crate::models::{Entity, Relationship, GRAPH_FIELD_SEP};

pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRecord {
    pub src: String,
    pub tgt: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionRecord {
    Entity(EntityRecord),
    Relationship(RelationshipRecord),
}

/// Split `raw` on `record_delim`, parse each tuple, and normalize
/// `entity_type`/entity name to uppercase. Malformed tuples are skipped
/// rather than failing the whole chunk (spec.md §4.3 step 4).
pub fn parse_records(raw: &str, tuple_delim: &str, record_delim: &str) -> Vec<ExtractionRecord> {
    raw.split(record_delim)
        .filter_map(|tuple| parse_one(tuple.trim(), tuple_delim))
        .collect()
}

fn parse_one(tuple: &str, tuple_delim: &str) -> Option<ExtractionRecord> {
    let trimmed = tuple.trim().trim_start_matches('(').trim_end_matches(')');
    if trimmed.is_empty() {
        return None;
    }
    let fields: Vec<&str> = trimmed.split(tuple_delim).map(str::trim).collect();
    match fields.first().map(|s| s.trim_matches('"').to_lowercase()).as_deref() {
        Some("entity") if fields.len() >= 4 => Some(ExtractionRecord::Entity(EntityRecord {
            name: canonical_entity_id(fields[1].trim_matches('"')),
            entity_type: fields[2].trim_matches('"').to_uppercase(),
            description: fields[3].trim_matches('"').to_string(),
        })),
        Some("relationship") if fields.len() >= 5 => Some(ExtractionRecord::Relationship(RelationshipRecord {
            src: canonical_entity_id(fields[1].trim_matches('"')),
            tgt: canonical_entity_id(fields[2].trim_matches('"')),
            description: fields[3].trim_matches('"').to_string(),
            weight: fields[4].trim_matches('"').parse().unwrap_or(1.0),
        })),
        _ => None,
    }
}

/// True if `raw` looks cut off mid-stream: it carries neither a trailing
/// record separator nor the completion marker (spec.md §4.3 step 3).
pub fn looks_truncated(raw: &str, record_delim: &str, completion_delim: &str) -> bool {
    let trimmed = raw.trim_end();
    !trimmed.ends_with(completion_delim) && !trimmed.ends_with(record_delim)
}

/// Clamp `records` to at most `max_entities`/`max_edges`, returning
/// whether clamping occurred (the caller logs a WARN, spec.md §4.3 step 5).
pub fn clamp_records(mut records: Vec<ExtractionRecord>, max_entities: usize, max_edges: usize) -> (Vec<ExtractionRecord>, bool) {
    let mut entity_count = 0usize;
    let mut edge_count = 0usize;
    let mut clamped = false;
    records.retain(|r| match r {
        ExtractionRecord::Entity(_) => {
            entity_count += 1;
            if entity_count > max_entities {
                clamped = true;
                false
            } else {
                true
            }
        }
        ExtractionRecord::Relationship(_) => {
            edge_count += 1;
            if edge_count > max_edges {
                clamped = true;
                false
            } else {
                true
            }
        }
    });
    (records, clamped)
}

/// One chunk's worth of parsed records, tagged with the chunk ID they
/// came from (needed to build each merged entity/edge's `source_id` set).
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub records: Vec<ExtractionRecord>,
}

/// A relation-type inference rule: if `pattern` appears (case-insensitive,
/// substring) in a merged edge's description, its `relation_type` becomes
/// `label`. Rules are evaluated in declared order; first match wins
/// (spec.md §4.3).
pub struct RelationPattern {
    pub pattern: String,
    pub label: String,
}

fn infer_relation_type(description: &str, patterns: &[RelationPattern]) -> String {
    let lower = description.to_lowercase();
    for rule in patterns {
        if lower.contains(&rule.pattern.to_lowercase()) {
            return sanitize_label(&rule.label);
        }
    }
    "RELATED".to_string()
}

/// Merge every chunk's extraction records for one document into the
/// document's entity and relationship sets (spec.md §4.3 "Per-document
/// merging"). Entity `entity_type` uses majority vote with ties broken by
/// first-seen; descriptions are deduplicated exact-match before joining.
pub fn merge_document(chunks: &[ChunkExtraction], relation_patterns: &[RelationPattern]) -> (Vec<Entity>, Vec<Relationship>) {
    struct EntityAccum {
        type_votes: HashMap<String, (usize, usize)>, // type -> (count, first_seen_order)
        descriptions: Vec<String>,
        source_ids: BTreeSet<String>,
    }
    struct EdgeAccum {
        descriptions: Vec<String>,
        source_ids: BTreeSet<String>,
        weight: f64,
    }

    let mut entities: HashMap<String, EntityAccum> = HashMap::new();
    let mut edges: HashMap<(String, String), EdgeAccum> = HashMap::new();
    let mut seen_order = 0usize;

    for chunk in chunks {
        for record in &chunk.records {
            match record {
                ExtractionRecord::Entity(e) => {
                    let accum = entities.entry(e.name.clone()).or_insert_with(|| EntityAccum {
                        type_votes: HashMap::new(),
                        descriptions: Vec::new(),
                        source_ids: BTreeSet::new(),
                    });
                    let entry = accum.type_votes.entry(e.entity_type.clone()).or_insert((0, seen_order));
                    entry.0 += 1;
                    seen_order += 1;
                    if !accum.descriptions.contains(&e.description) {
                        accum.descriptions.push(e.description.clone());
                    }
                    accum.source_ids.insert(chunk.chunk_id.clone());
                }
                ExtractionRecord::Relationship(r) => {
                    let accum = edges.entry((r.src.clone(), r.tgt.clone())).or_insert_with(|| EdgeAccum {
                        descriptions: Vec::new(),
                        source_ids: BTreeSet::new(),
                        weight: 0.0,
                    });
                    if !accum.descriptions.contains(&r.description) {
                        accum.descriptions.push(r.description.clone());
                    }
                    accum.source_ids.insert(chunk.chunk_id.clone());
                    accum.weight += r.weight;
                }
            }
        }
    }

    let merged_entities = entities
        .into_iter()
        .map(|(name, accum)| {
            let entity_type = accum
                .type_votes
                .into_iter()
                .max_by_key(|(_, (count, first_seen))| (*count, std::cmp::Reverse(*first_seen)))
                .map(|(t, _)| t)
                .unwrap_or_else(|| "UNKNOWN".to_string());
            Entity {
                name,
                entity_type,
                description: accum.descriptions.join(GRAPH_FIELD_SEP),
                source_ids: accum.source_ids,
                clusters: Vec::new(),
                has_vector: false,
            }
        })
        .collect();

    let merged_edges = edges
        .into_iter()
        .map(|((src, tgt), accum)| {
            let description = accum.descriptions.join(GRAPH_FIELD_SEP);
            let relation_type = infer_relation_type(&description, relation_patterns);
            Relationship {
                src,
                tgt,
                weight: accum.weight,
                description,
                source_ids: accum.source_ids,
                relation_type,
                order: 0,
            }
        })
        .collect();

    (merged_entities, merged_edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entity_and_relationship_tuples() {
        let raw = format!(
            "(\"entity\"{td}\"Alice Smith\"{td}person{td}a person){rd}(\"relationship\"{td}\"Alice Smith\"{td}\"Acme Corp\"{td}works at{td}1.0){rd}{cd}",
            td = TUPLE_DELIMITER,
            rd = RECORD_DELIMITER,
            cd = COMPLETION_DELIMITER
        );
        let records = parse_records(&raw, TUPLE_DELIMITER, RECORD_DELIMITER);
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], ExtractionRecord::Entity(e) if e.name == "ALICE SMITH" && e.entity_type == "PERSON"));
        assert!(matches!(&records[1], ExtractionRecord::Relationship(r) if r.src == "ALICE SMITH" && r.tgt == "ACME CORP"));
    }

    #[test]
    fn malformed_tuple_is_skipped_not_fatal() {
        let raw = format!("(\"entity\"{td}onlytwo){rd}", td = TUPLE_DELIMITER, rd = RECORD_DELIMITER);
        let records = parse_records(&raw, TUPLE_DELIMITER, RECORD_DELIMITER);
        assert!(records.is_empty());
    }

    #[test]
    fn looks_truncated_detects_missing_terminator() {
        assert!(looks_truncated("partial response with no terminator", RECORD_DELIMITER, COMPLETION_DELIMITER));
        assert!(!looks_truncated(&format!("done{COMPLETION_DELIMITER}"), RECORD_DELIMITER, COMPLETION_DELIMITER));
    }

    #[test]
    fn clamp_records_respects_independent_entity_and_edge_limits() {
        let records = vec![
            ExtractionRecord::Entity(EntityRecord { name: "A".into(), entity_type: "PERSON".into(), description: String::new() }),
            ExtractionRecord::Entity(EntityRecord { name: "B".into(), entity_type: "PERSON".into(), description: String::new() }),
            ExtractionRecord::Relationship(RelationshipRecord { src: "A".into(), tgt: "B".into(), description: String::new(), weight: 1.0 }),
        ];
        let (clamped, did_clamp) = clamp_records(records, 1, 10);
        assert_eq!(clamped.len(), 2);
        assert!(did_clamp);
    }

    #[test]
    fn merge_unions_source_ids_and_sums_weight() {
        let chunks = vec![
            ChunkExtraction {
                chunk_id: "chunk-1".into(),
                records: vec![ExtractionRecord::Relationship(RelationshipRecord {
                    src: "A".into(),
                    tgt: "B".into(),
                    description: "parent of".into(),
                    weight: 1.0,
                })],
            },
            ChunkExtraction {
                chunk_id: "chunk-2".into(),
                records: vec![ExtractionRecord::Relationship(RelationshipRecord {
                    src: "A".into(),
                    tgt: "B".into(),
                    description: "parent of".into(),
                    weight: 2.0,
                })],
            },
        ];
        let patterns = vec![RelationPattern { pattern: "parent of".into(), label: "PARENT_OF".into() }];
        let (_, edges) = merge_document(&chunks, &patterns);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, 3.0);
        assert_eq!(edges[0].source_ids.len(), 2);
        assert_eq!(edges[0].relation_type, "PARENT_OF");
    }

    #[test]
    fn merge_deduplicates_exact_equal_descriptions() {
        let chunks = vec![
            ChunkExtraction {
                chunk_id: "chunk-1".into(),
                records: vec![ExtractionRecord::Entity(EntityRecord { name: "A".into(), entity_type: "PERSON".into(), description: "same".into() })],
            },
            ChunkExtraction {
                chunk_id: "chunk-2".into(),
                records: vec![ExtractionRecord::Entity(EntityRecord { name: "A".into(), entity_type: "PERSON".into(), description: "same".into() })],
            },
        ];
        let (entities, _) = merge_document(&chunks, &[]);
        assert_eq!(entities[0].description, "same");
    }

    #[test]
    fn merge_entity_type_majority_vote_ties_broken_by_first_seen() {
        let chunks = vec![
            ChunkExtraction {
                chunk_id: "chunk-1".into(),
                records: vec![ExtractionRecord::Entity(EntityRecord { name: "A".into(), entity_type: "PERSON".into(), description: String::new() })],
            },
            ChunkExtraction {
                chunk_id: "chunk-2".into(),
                records: vec![ExtractionRecord::Entity(EntityRecord { name: "A".into(), entity_type: "ORGANIZATION".into(), description: String::new() })],
            },
        ];
        let (entities, _) = merge_document(&chunks, &[]);
        assert_eq!(entities[0].entity_type, "PERSON");
    }

    #[test]
    fn directed_edges_in_opposite_directions_stay_distinct() {
        let chunks = vec![ChunkExtraction {
            chunk_id: "chunk-1".into(),
            records: vec![
                ExtractionRecord::Relationship(RelationshipRecord { src: "A".into(), tgt: "B".into(), description: "x".into(), weight: 1.0 }),
                ExtractionRecord::Relationship(RelationshipRecord { src: "B".into(), tgt: "A".into(), description: "y".into(), weight: 1.0 }),
            ],
        }];
        let (_, edges) = merge_document(&chunks, &[]);
        assert_eq!(edges.len(), 2);
    }
}
