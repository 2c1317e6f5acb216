//! Context Inflator: merge adjacent molecules into spans, then
//! expand each span outward via exact byte offsets until a char budget is
//! exhausted.
//!
//! Grounded on the source project's `budget.rs` `allocate_budget` shape: a
//! ranked list is walked greedily against a shared budget, each item
//! consuming from the remainder until nothing is left, generalized here from
//! file-sized units to byte-addressed spans inside a single compound body.

use std::collections::HashMap;

use crate::model::Provenance;
use crate::search::ScoredResult;
use crate::store::Store;

/// Default per-span expansion ceiling.
pub const DEFAULT_SPAN_CHAR_CAP: usize = 1024;
/// Default merge-adjacent-spans gap threshold, in bytes.
pub const DEFAULT_MERGE_GAP_BYTES: usize = 200;

/// One inflated, budget-truncated span of a compound's body, annotated with
/// its source path and timestamp.
#[derive(Debug, Clone)]
pub struct InflatedSpan {
    pub compound_id: String,
    pub source_path: String,
    pub timestamp: i64,
    pub bucket: String,
    pub provenance: Provenance,
    pub tags: Vec<String>,
    pub start_byte: usize,
    pub end_byte: usize,
    pub content: String,
    pub score: f64,
}

struct MergedSpan {
    start_byte: usize,
    end_byte: usize,
    score: f64,
    source_path: String,
    timestamp: i64,
    bucket: String,
    provenance: Provenance,
    tags: Vec<String>,
}

/// Sorts one compound's results by `start_byte` and merges any whose gap is
/// `<= merge_gap` bytes into a single span, taking the max of constituent
/// scores.
fn merge_group(mut rows: Vec<ScoredResult>, merge_gap: usize) -> Vec<MergedSpan> {
    rows.sort_by_key(|r| r.start_byte);
    let mut out: Vec<MergedSpan> = Vec::new();
    for r in rows {
        if let Some(last) = out.last_mut() {
            if r.start_byte <= last.end_byte.saturating_add(merge_gap) {
                last.end_byte = last.end_byte.max(r.end_byte);
                last.score = last.score.max(r.score);
                for t in r.tags {
                    if !last.tags.contains(&t) {
                        last.tags.push(t);
                    }
                }
                continue;
            }
        }
        out.push(MergedSpan {
            start_byte: r.start_byte,
            end_byte: r.end_byte,
            score: r.score,
            source_path: r.source_path,
            timestamp: r.timestamp,
            bucket: r.bucket,
            provenance: r.provenance,
            tags: r.tags,
        });
    }
    out
}

/// Widens `[start, end)` equally on both sides to approach `target_width`,
/// clamped to `[0, body_len)` and snapped to the nearest UTF-8 char
/// boundary.
fn expand_span(start: usize, end: usize, body_len: usize, body: &str, target_width: usize) -> (usize, usize) {
    let width = end.saturating_sub(start);
    let slack = target_width.saturating_sub(width.min(target_width));
    let each_side = slack / 2;

    let mut new_start = start.saturating_sub(each_side);
    while new_start > 0 && !body.is_char_boundary(new_start) {
        new_start -= 1;
    }
    let mut new_end = (end + each_side).min(body_len);
    while new_end < body_len && !body.is_char_boundary(new_end) {
        new_end += 1;
    }
    (new_start, new_end.min(body_len))
}

/// Truncates `text` to at most `max_chars` characters at a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    if text.chars().count() <= max_chars {
        return text;
    }
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runs the Context Inflator with the default span cap and merge-gap thresholds.
pub async fn inflate(store: &Store, results: Vec<ScoredResult>, max_chars: usize) -> Vec<InflatedSpan> {
    inflate_with_params(store, results, max_chars, DEFAULT_SPAN_CHAR_CAP, DEFAULT_MERGE_GAP_BYTES).await
}

/// Groups `results` by compound, merges adjacent spans, expands each
/// outward up to `per_span_cap` chars, and reads the expanded range back
/// from the store — stopping once `max_chars` total characters have been
/// consumed.
pub async fn inflate_with_params(
    store: &Store,
    results: Vec<ScoredResult>,
    max_chars: usize,
    per_span_cap: usize,
    merge_gap: usize,
) -> Vec<InflatedSpan> {
    let mut groups: HashMap<String, Vec<ScoredResult>> = HashMap::new();
    for r in results {
        groups.entry(r.compound_id.clone()).or_default().push(r);
    }

    let mut merged_all: Vec<(String, MergedSpan)> = Vec::new();
    for (compound_id, rows) in groups {
        for span in merge_group(rows, merge_gap) {
            merged_all.push((compound_id.clone(), span));
        }
    }
    merged_all.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = Vec::new();
    let mut budget_used = 0usize;

    for (compound_id, span) in merged_all {
        if budget_used >= max_chars {
            break;
        }
        let Ok(body) = store.read_compound_body(&compound_id, 0, usize::MAX).await else {
            continue;
        };
        let body_len = body.len();
        let (start, end) = expand_span(span.start_byte, span.end_byte, body_len, &body, per_span_cap);
        let slice = body.get(start..end).unwrap_or("");

        let remaining = max_chars.saturating_sub(budget_used);
        let content = truncate_chars(slice, remaining).to_string();
        if content.is_empty() && !out.is_empty() {
            break;
        }
        budget_used += content.chars().count();

        out.push(InflatedSpan {
            compound_id,
            source_path: span.source_path,
            timestamp: span.timestamp,
            bucket: span.bucket,
            provenance: span.provenance,
            tags: span.tags,
            start_byte: start,
            end_byte: end,
            content,
            score: span.score,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Compound, Provenance};

    fn result(compound_id: &str, start: usize, end: usize, score: f64) -> ScoredResult {
        ScoredResult {
            molecule_id: format!("{compound_id}-{start}"),
            compound_id: compound_id.to_string(),
            content: String::new(),
            source_path: format!("{compound_id}.md"),
            timestamp: 1_700_000_000_000,
            bucket: "inbox".to_string(),
            tags: vec![],
            provenance: Provenance::Internal,
            molecular_signature: 0,
            start_byte: start,
            end_byte: end,
            score,
        }
    }

    async fn store_with_body(compound_id: &str, body: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[Compound {
                id: compound_id.to_string(),
                path: format!("{compound_id}.md"),
                timestamp: 1_700_000_000_000,
                provenance: Provenance::Internal,
                molecular_signature: 0,
                compound_body: body.to_string(),
                bucket: "inbox".to_string(),
                molecule_ids: vec![],
                atom_ids: vec![],
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn adjacent_spans_merge_within_gap_threshold() {
        let body = "a".repeat(500);
        let store = store_with_body("c1", &body).await;
        let results = vec![result("c1", 0, 10, 1.0), result("c1", 15, 25, 2.0)];
        let spans = inflate_with_params(&store, results, 10_000, 1024, 200).await;
        assert_eq!(spans.len(), 1);
        assert!(spans[0].score >= 2.0);
    }

    #[tokio::test]
    async fn distant_spans_stay_separate() {
        let body = "x".repeat(5000);
        let store = store_with_body("c1", &body).await;
        let results = vec![result("c1", 0, 10, 1.0), result("c1", 4000, 4010, 2.0)];
        let spans = inflate_with_params(&store, results, 10_000, 1024, 200).await;
        assert_eq!(spans.len(), 2);
    }

    #[tokio::test]
    async fn global_budget_is_respected() {
        let body = "y".repeat(5000);
        let store = store_with_body("c1", &body).await;
        let results = vec![result("c1", 0, 10, 5.0), result("c1", 2000, 2010, 1.0)];
        let spans = inflate_with_params(&store, results, 100, 1024, 0).await;
        let total: usize = spans.iter().map(|s| s.content.chars().count()).sum();
        assert!(total <= 100);
    }

    #[tokio::test]
    async fn span_expansion_respects_compound_boundary() {
        let body = "short body";
        let store = store_with_body("c1", body).await;
        let results = vec![result("c1", 0, 5, 1.0)];
        let spans = inflate_with_params(&store, results, 10_000, 1024, 200).await;
        assert_eq!(spans[0].content, body);
        assert_eq!(spans[0].end_byte, body.len());
    }
}
