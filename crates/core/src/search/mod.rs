//! Searcher / Tag-Walker: parse → FTS anchor phase → tag-walk
//! phase → score → dedup → truncate.
//!
//! Grounded on the source project's `budget.rs` scoring/allocation style
//! (static importance weights folded into a single multiplicative score,
//! then a budget walk that stops at a char ceiling), generalized here to
//! the fixed `fts_score · provenance_boost · tag_overlap · time_decay`
//! formula this spec defines.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::fingerprint::hamming;
use crate::model::Provenance;
use crate::store::{FtsRow, Store};
use crate::tags::atom_id;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "at", "to", "for", "and", "or", "is", "are", "was", "were",
    "be", "been", "it", "this", "that", "with", "as", "by", "from",
];

/// Ranking intent detected from the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    None,
    Earliest,
    Latest,
}

pub struct ParsedQuery {
    pub terms: Vec<String>,
    pub intent: Intent,
}

fn conversational_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:what|who|when|where|why|how)\s+(?:is|was|are|were)\s+the\s+.+?\s+of\s+(.+?)\??$")
            .unwrap()
    })
}

/// Rewrites `what is the … of …`-style questions to their trailing noun
/// phrase by substring extraction.
fn rewrite_conversational_prefix(lower: &str) -> String {
    match conversational_prefix().captures(lower) {
        Some(caps) => caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| lower.to_string()),
        None => lower.to_string(),
    }
}

/// Lowercases, strips stopwords, and detects `earliest`/`latest`/`recent`
/// intent markers ahead of stopword/prefix rewriting so the marker word
/// itself is still recognized even though it never survives into `terms`.
pub fn parse_query(raw: &str) -> ParsedQuery {
    let lower = raw.to_lowercase();
    let intent = if lower.split_whitespace().any(|w| w == "earliest") {
        Intent::Earliest
    } else if lower.split_whitespace().any(|w| w == "latest" || w == "recent") {
        Intent::Latest
    } else {
        Intent::None
    };

    let rewritten = rewrite_conversational_prefix(&lower);
    let terms: Vec<String> = rewritten
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| {
            !w.is_empty()
                && !STOPWORDS.contains(&w.as_str())
                && w != "earliest"
                && w != "latest"
                && w != "recent"
        })
        .collect();

    ParsedQuery { terms, intent }
}

fn fts_and_query(terms: &[String]) -> String {
    terms.iter().map(|t| format!("\"{t}\"")).collect::<Vec<_>>().join(" ")
}

fn fts_or_query(terms: &[String]) -> String {
    terms.iter().map(|t| format!("\"{t}\"")).collect::<Vec<_>>().join(" OR ")
}

fn days_since(timestamp_ms: i64, now_ms: i64) -> f64 {
    ((now_ms - timestamp_ms).max(0) as f64) / 86_400_000.0
}

fn time_decay(timestamp_ms: i64, now_ms: i64) -> f64 {
    1.0 / (1.0 + days_since(timestamp_ms, now_ms) / 30.0)
}

/// One scored, not-yet-inflated candidate.
#[derive(Debug, Clone)]
pub struct ScoredResult {
    pub molecule_id: String,
    pub compound_id: String,
    pub content: String,
    pub source_path: String,
    pub timestamp: i64,
    pub bucket: String,
    pub tags: Vec<String>,
    pub provenance: Provenance,
    pub molecular_signature: u64,
    pub start_byte: usize,
    pub end_byte: usize,
    pub score: f64,
}

/// Baseline `fts_score` credited to a molecule surfaced only by the walk
/// phase (it never matched the FTS query directly, but still needs a
/// strictly positive score per scenario S4).
const WALK_BASELINE_SCORE: f64 = 1.0;

fn tag_overlap_count(anchor_tags: &HashSet<String>, row_tags: &[String]) -> usize {
    row_tags.iter().filter(|t| anchor_tags.contains(t.as_str())).count()
}

fn score_row(row: &FtsRow, fts_score: f64, tag_overlap: usize, now_ms: i64) -> f64 {
    let provenance_boost = row.provenance.boost();
    fts_score * provenance_boost * (1.0 + tag_overlap as f64 * 0.2) * time_decay(row.timestamp, now_ms)
}

fn dedup_by_fingerprint(mut results: Vec<ScoredResult>) -> Vec<ScoredResult> {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<ScoredResult> = Vec::new();
    'outer: for candidate in results {
        for existing in &kept {
            if hamming(candidate.molecular_signature, existing.molecular_signature) <= 3 {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

fn order_by_intent(results: &mut [ScoredResult], intent: Intent) {
    match intent {
        Intent::Earliest => results.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .reverse()
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        }),
        _ => results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        }),
    }
}

/// Truncates `results` (already inflated or not) so the running sum of
/// content lengths never exceeds `max_chars`.
fn truncate_to_char_budget(results: Vec<ScoredResult>, max_chars: usize) -> Vec<ScoredResult> {
    let mut used = 0usize;
    let mut out = Vec::new();
    for r in results {
        let len = r.content.chars().count();
        if used + len > max_chars && !out.is_empty() {
            break;
        }
        used += len;
        out.push(r);
        if used >= max_chars {
            break;
        }
    }
    out
}

pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub buckets: Option<&'a [String]>,
    pub tags: Option<&'a [String]>,
    pub max_chars: usize,
    pub provenance: Option<Provenance>,
}

/// Runs the full Tag-Walker pipeline and returns a
/// score-ordered, deduplicated, budget-truncated result set. `now_ms`
/// drives `time_decay` and is supplied by the caller rather than sampled
/// internally, keeping this function pure given its inputs.
pub async fn search(store: &Store, req: &SearchRequest<'_>, now_ms: i64) -> Vec<ScoredResult> {
    let parsed = parse_query(req.query);
    if parsed.terms.is_empty() {
        return Vec::new();
    }

    let anchor_limit = 200usize;
    let mut anchors = store
        .search_fts(&fts_and_query(&parsed.terms), req.buckets, req.provenance, anchor_limit)
        .await
        .unwrap_or_default();
    if anchors.is_empty() {
        anchors = store
            .search_fts(&fts_or_query(&parsed.terms), req.buckets, req.provenance, anchor_limit)
            .await
            .unwrap_or_default();
    }

    let anchors = match req.tags {
        Some(required) if !required.is_empty() => anchors
            .into_iter()
            .filter(|r| required.iter().any(|t| r.tags.contains(t)))
            .collect(),
        _ => anchors,
    };

    let mut anchor_tags: HashSet<String> = HashSet::new();
    for a in &anchors {
        anchor_tags.extend(a.tags.iter().cloned());
    }

    let mut results: Vec<ScoredResult> = anchors
        .iter()
        .map(|row| {
            let overlap = tag_overlap_count(&anchor_tags, &row.tags);
            ScoredResult {
                molecule_id: row.id.clone(),
                compound_id: row.compound_id.clone(),
                content: row.content.clone(),
                source_path: row.source_path.clone(),
                timestamp: row.timestamp,
                bucket: row.bucket.clone(),
                tags: row.tags.clone(),
                provenance: row.provenance,
                molecular_signature: row.molecular_signature,
                start_byte: row.start_byte,
                end_byte: row.end_byte,
                score: score_row(row, row.fts_score.max(0.0), overlap, now_ms),
            }
        })
        .collect();

    if !anchor_tags.is_empty() {
        let seed_atom_ids: Vec<String> = anchor_tags.iter().map(|t| atom_id(t)).collect();
        let walk_hits =
            store.walk(&seed_atom_ids, req.buckets, 50, 1).await.unwrap_or_default();
        let anchor_ids: HashSet<String> = results.iter().map(|r| r.molecule_id.clone()).collect();

        for hit in walk_hits {
            if anchor_ids.contains(&hit.molecule_id) {
                continue;
            }
            if let Ok(Some(row)) = store.molecule_by_id(&hit.molecule_id).await {
                let overlap = tag_overlap_count(&anchor_tags, &row.tags);
                if overlap == 0 {
                    continue;
                }
                results.push(ScoredResult {
                    molecule_id: row.id.clone(),
                    compound_id: row.compound_id.clone(),
                    content: row.content.clone(),
                    source_path: row.source_path.clone(),
                    timestamp: row.timestamp,
                    bucket: row.bucket.clone(),
                    tags: row.tags.clone(),
                    provenance: row.provenance,
                    molecular_signature: row.molecular_signature,
                    start_byte: row.start_byte,
                    end_byte: row.end_byte,
                    score: score_row(&row, WALK_BASELINE_SCORE, overlap, now_ms),
                });
            }
        }
    }

    let mut results = dedup_by_fingerprint(results);
    order_by_intent(&mut results, parsed.intent);
    truncate_to_char_budget(results, req.max_chars)
}

/// `molecule_search`: splits `query` into sentences and unions
/// the per-sentence search results, deduplicating by molecule id.
pub async fn molecule_search(
    store: &Store,
    query: &str,
    buckets: Option<&[String]>,
    tags: Option<&[String]>,
    max_chars: usize,
    provenance: Option<Provenance>,
    now_ms: i64,
) -> Vec<ScoredResult> {
    let sentences: Vec<&str> = query
        .split(|c: char| c == '.' || c == '!' || c == '?')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let sentences = if sentences.is_empty() { vec![query] } else { sentences };

    let mut seen = HashSet::new();
    let mut combined = Vec::new();
    for sentence in sentences {
        let req = SearchRequest { query: sentence, buckets, tags, max_chars, provenance };
        for result in search(store, &req, now_ms).await {
            if seen.insert(result.molecule_id.clone()) {
                combined.push(result);
            }
        }
    }
    let mut combined = dedup_by_fingerprint(combined);
    order_by_intent(&mut combined, Intent::None);
    truncate_to_char_budget(combined, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Atom, AtomType, Compound, Molecule, MoleculeType, TagRow};

    fn compound(id: &str, bucket: &str, provenance: Provenance, body: &str, ts: i64) -> Compound {
        Compound {
            id: id.to_string(),
            path: format!("{bucket}/{id}.md"),
            timestamp: ts,
            provenance,
            molecular_signature: 1,
            compound_body: body.to_string(),
            bucket: bucket.to_string(),
            molecule_ids: vec![format!("{id}-m0")],
            atom_ids: vec![],
        }
    }

    fn molecule(id: &str, compound_id: &str, content: &str, ts: i64, sig: u64) -> Molecule {
        Molecule {
            id: id.to_string(),
            compound_id: compound_id.to_string(),
            sequence: 0,
            content: content.to_string(),
            r#type: MoleculeType::Prose,
            start_byte: 0,
            end_byte: content.len(),
            numeric_value: None,
            numeric_unit: None,
            molecular_signature: sig,
            timestamp: ts,
            atom_ids: vec![],
        }
    }

    #[test]
    fn parse_query_strips_stopwords_and_detects_earliest_intent() {
        let parsed = parse_query("find the earliest report about rust");
        assert_eq!(parsed.intent, Intent::Earliest);
        assert!(parsed.terms.contains(&"report".to_string()));
        assert!(parsed.terms.contains(&"rust".to_string()));
        assert!(!parsed.terms.contains(&"the".to_string()));
        assert!(!parsed.terms.contains(&"earliest".to_string()));
    }

    #[test]
    fn parse_query_rewrites_conversational_prefix() {
        let parsed = parse_query("what is the capital of france");
        assert_eq!(parsed.terms, vec!["france".to_string()]);
    }

    #[tokio::test]
    async fn bucket_isolation_excludes_other_buckets_end_to_end() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[
                compound("c1", "personal", Provenance::Internal, "My personal diary entry about sensitive stuff", 1_700_000_000_000),
                compound("c2", "code", Provenance::Internal, "function sensitiveCode() {}", 1_700_000_000_000),
            ])
            .await
            .unwrap();
        store
            .upsert_molecules(&[
                molecule("c1-m0", "c1", "My personal diary entry about sensitive stuff", 1_700_000_000_000, 11),
                molecule("c2-m0", "c2", "function sensitiveCode() {}", 1_700_000_000_000, 22),
            ])
            .await
            .unwrap();

        let buckets = vec!["personal".to_string()];
        let req = SearchRequest {
            query: "sensitive",
            buckets: Some(&buckets),
            tags: None,
            max_chars: 10_000,
            provenance: None,
        };
        let results = search(&store, &req, 1_700_000_100_000).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].bucket, "personal");
    }

    #[tokio::test]
    async fn tag_walker_surfaces_linked_molecule_with_lower_score() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_atoms(&[Atom {
                id: atom_id("#project:apollo"),
                label: "#project:apollo".to_string(),
                r#type: AtomType::System,
                weight: 1.0,
            }])
            .await
            .unwrap();
        store
            .upsert_tags(&[
                TagRow { atom_id: atom_id("#project:apollo"), tag: "#project:apollo".into(), bucket: "work".into() },
            ])
            .await
            .unwrap();
        store
            .upsert_compounds(&[
                compound("a", "work", Provenance::Internal, "launch schedule for apollo project", 1_700_000_000_000),
                compound("b", "work", Provenance::Internal, "no matching terms here at all", 1_700_000_000_000),
            ])
            .await
            .unwrap();
        // Both molecules carry the shared atom id in `atom_ids` so the walk
        // phase's `molecules_for_atoms` lookup links them: `a-m0` is the FTS
        // anchor, `b-m0` shares no query terms and can only surface by
        // walking from the atom they have in common.
        let mut a_m0 = molecule("a-m0", "a", "launch schedule for apollo project", 1_700_000_000_000, 101);
        a_m0.atom_ids = vec![atom_id("#project:apollo")];
        let mut b_m0 = molecule("b-m0", "b", "no matching terms here at all", 1_700_000_000_000, 202);
        b_m0.atom_ids = vec![atom_id("#project:apollo")];
        store.upsert_molecules(&[a_m0, b_m0]).await.unwrap();

        let req = SearchRequest { query: "launch", buckets: None, tags: None, max_chars: 10_000, provenance: None };
        let results = search(&store, &req, 1_700_000_100_000).await;
        assert!(results.iter().any(|r| r.molecule_id == "a-m0"));
        let walked = results.iter().find(|r| r.molecule_id == "b-m0");
        assert!(walked.is_some(), "walk phase should surface b-m0 via the shared #project:apollo atom");
        let anchor_score = results.iter().find(|r| r.molecule_id == "a-m0").unwrap().score;
        assert!(walked.unwrap().score > 0.0);
        assert!(anchor_score > walked.unwrap().score);
    }

    #[test]
    fn dedup_keeps_only_highest_scoring_near_duplicate() {
        let make = |id: &str, score: f64, sig: u64| ScoredResult {
            molecule_id: id.to_string(),
            compound_id: "c".to_string(),
            content: "x".to_string(),
            source_path: "p".to_string(),
            timestamp: 0,
            bucket: "b".to_string(),
            tags: vec![],
            provenance: Provenance::Internal,
            molecular_signature: sig,
            start_byte: 0,
            end_byte: 1,
            score,
        };
        let results = vec![make("m1", 5.0, 0b1010), make("m2", 2.0, 0b1011)];
        let deduped = dedup_by_fingerprint(results);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].molecule_id, "m1");
    }

    #[test]
    fn char_budget_truncation_keeps_at_least_one_result() {
        let make = |id: &str, content: &str| ScoredResult {
            molecule_id: id.to_string(),
            compound_id: "c".to_string(),
            content: content.to_string(),
            source_path: "p".to_string(),
            timestamp: 0,
            bucket: "b".to_string(),
            tags: vec![],
            provenance: Provenance::Internal,
            molecular_signature: 0,
            start_byte: 0,
            end_byte: content.len(),
            score: 1.0,
        };
        let results = vec![make("m1", &"a".repeat(50)), make("m2", &"b".repeat(50))];
        let truncated = truncate_to_char_budget(results, 60);
        assert_eq!(truncated.len(), 1);
    }
}
