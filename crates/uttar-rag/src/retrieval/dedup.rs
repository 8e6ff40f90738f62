//! Three-pass duplicate removal over the ranked result list.
//!
//! Pass 1 drops byte-identical content (after whitespace normalization),
//! pass 2 drops near-duplicates by word overlap, pass 3 drops semantic
//! duplicates by embedding similarity. Results arrive sorted by score, so
//! each pass walks top-down and the highest-scored copy always survives.

use std::collections::HashSet;

use crate::retrieval::diversity::cosine_similarity;
use crate::types::RetrievedResult;

/// Embedding similarity above which two chunks count as the same content.
const SEMANTIC_DUPLICATE_THRESHOLD: f32 = 0.95;

/// How many results each pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub exact_removed: usize,
    pub near_removed: usize,
    pub semantic_removed: usize,
}

impl DedupReport {
    pub fn total_removed(&self) -> usize {
        self.exact_removed + self.near_removed + self.semantic_removed
    }
}

/// Word-overlap similarity of two texts (lowercase alphanumeric words longer
/// than two characters). 1.0 for two empty texts.
pub fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    jaccard_of_sets(&set_a, &set_b)
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| w.len() > 2)
        .collect()
}

fn jaccard_of_sets(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

/// Remove duplicates in three passes, keeping the highest-scored copy.
///
/// `near_threshold` is the word-overlap ratio above which two chunks count as
/// near-duplicates. Returns the surviving results plus per-pass counts.
pub fn deduplicate_results(
    results: Vec<RetrievedResult>,
    near_threshold: f32,
) -> (Vec<RetrievedResult>, DedupReport) {
    let mut report = DedupReport::default();
    if results.len() <= 1 {
        return (results, report);
    }

    // Pass 1: exact content after whitespace normalization.
    let mut seen = HashSet::new();
    let mut results: Vec<RetrievedResult> = results
        .into_iter()
        .filter(|r| {
            let normalized = r.content.split_whitespace().collect::<Vec<_>>().join(" ");
            if seen.insert(normalized) {
                true
            } else {
                report.exact_removed += 1;
                false
            }
        })
        .collect();

    // Pass 2: near-duplicates by word overlap. Top-down walk so the
    // higher-scored copy marks later ones.
    if results.len() > 1 {
        let word_sets: Vec<HashSet<String>> =
            results.iter().map(|r| word_set(&r.content)).collect();
        let mut keep = vec![true; results.len()];
        for i in 0..results.len() {
            if !keep[i] {
                continue;
            }
            for j in (i + 1)..results.len() {
                if !keep[j] {
                    continue;
                }
                let overlap = jaccard_of_sets(&word_sets[i], &word_sets[j]);
                if overlap >= near_threshold {
                    keep[j] = false;
                    report.near_removed += 1;
                    tracing::debug!(
                        kept_score = results[i].score,
                        dropped_score = results[j].score,
                        overlap = format!("{:.0}%", overlap * 100.0),
                        "dropped near-duplicate chunk"
                    );
                }
            }
        }
        let mut idx = 0;
        results.retain(|_| {
            let kept = keep[idx];
            idx += 1;
            kept
        });
    }

    // Pass 3: semantic duplicates by embedding similarity. Only pairs where
    // both sides carry an embedding are comparable.
    if results.len() > 1 {
        let mut keep = vec![true; results.len()];
        for i in 0..results.len() {
            if !keep[i] {
                continue;
            }
            let Some(embedding_i) = results[i].embedding.as_deref() else {
                continue;
            };
            for j in (i + 1)..results.len() {
                if !keep[j] {
                    continue;
                }
                let Some(embedding_j) = results[j].embedding.as_deref() else {
                    continue;
                };
                if cosine_similarity(embedding_i, embedding_j) >= SEMANTIC_DUPLICATE_THRESHOLD {
                    keep[j] = false;
                    report.semantic_removed += 1;
                }
            }
        }
        let mut idx = 0;
        results.retain(|_| {
            let kept = keep[idx];
            idx += 1;
            kept
        });
    }

    if report.total_removed() > 0 {
        tracing::debug!(
            exact = report.exact_removed,
            near = report.near_removed,
            semantic = report.semantic_removed,
            remaining = results.len(),
            "deduplication finished"
        );
    }

    (results, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultOrigin;
    use std::collections::HashMap;

    fn result(id: &str, content: &str, score: f32) -> RetrievedResult {
        RetrievedResult {
            id: id.to_string(),
            content: content.to_string(),
            score,
            origin: ResultOrigin::Document {
                document_id: format!("doc-{}", id),
                chunk_index: 0,
            },
            embedding: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_exact_duplicates_removed() {
        let results = vec![
            result("a", "The quick brown fox.", 0.9),
            result("b", "The   quick\nbrown fox.", 0.8),
            result("c", "Something else entirely.", 0.7),
        ];
        let (deduped, report) = deduplicate_results(results, 0.85);
        assert_eq!(deduped.len(), 2);
        assert_eq!(report.exact_removed, 1);
        assert_eq!(deduped[0].id, "a");
    }

    #[test]
    fn test_near_duplicates_keep_highest_scored() {
        let results = vec![
            result("a", "rust ownership model explained with borrowing rules", 0.9),
            result("b", "rust ownership model explained with borrowing rules today", 0.7),
            result("c", "unrelated cooking recipe for sourdough bread", 0.6),
        ];
        let (deduped, report) = deduplicate_results(results, 0.85);
        assert_eq!(deduped.len(), 2);
        assert_eq!(report.near_removed, 1);
        assert!(deduped.iter().any(|r| r.id == "a"));
        assert!(deduped.iter().all(|r| r.id != "b"));
    }

    #[test]
    fn test_semantic_duplicates_removed_via_embeddings() {
        let mut a = result("a", "first phrasing of the fact", 0.9);
        a.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut b = result("b", "second phrasing of that same fact", 0.8);
        b.embedding = Some(vec![0.999, 0.01, 0.0]);
        let mut c = result("c", "different topic entirely", 0.7);
        c.embedding = Some(vec![0.0, 1.0, 0.0]);

        let (deduped, report) = deduplicate_results(vec![a, b, c], 0.85);
        assert_eq!(deduped.len(), 2);
        assert_eq!(report.semantic_removed, 1);
        assert!(deduped.iter().all(|r| r.id != "b"));
    }

    #[test]
    fn test_missing_embeddings_skip_semantic_pass() {
        let results = vec![
            result("a", "alpha beta gamma delta", 0.9),
            result("b", "epsilon zeta eta theta", 0.8),
        ];
        let (deduped, report) = deduplicate_results(results, 0.85);
        assert_eq!(deduped.len(), 2);
        assert_eq!(report.semantic_removed, 0);
    }

    #[test]
    fn test_jaccard_edge_cases() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("alpha beta", "alpha beta"), 1.0);
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn test_single_result_untouched() {
        let results = vec![result("a", "only one", 0.9)];
        let (deduped, report) = deduplicate_results(results, 0.85);
        assert_eq!(deduped.len(), 1);
        assert_eq!(report.total_removed(), 0);
    }
}
