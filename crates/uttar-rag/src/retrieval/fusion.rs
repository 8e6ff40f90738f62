//! Fusing dense and keyword result lists into one ranked list.
//!
//! Score-aware reciprocal rank fusion: standard RRF weighted by each list's
//! normalized original scores, so a high-confidence match gets a boost over
//! one that merely ranked well. The fused scores are re-normalized to [0, 1]
//! because raw RRF values live in the 0.01-0.05 range where similarity
//! thresholds would be meaningless.

use std::collections::HashMap;

use crate::types::RetrievedResult;

/// Which retrieval arm produced a fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionSource {
    Dense,
    Keyword,
    Both,
}

impl FusionSource {
    fn as_str(&self) -> &'static str {
        match self {
            FusionSource::Dense => "dense",
            FusionSource::Keyword => "keyword",
            FusionSource::Both => "both",
        }
    }
}

fn normalize_scores(results: &[RetrievedResult]) -> HashMap<String, f32> {
    if results.is_empty() {
        return HashMap::new();
    }
    let max = results.iter().map(|r| r.score).fold(f32::MIN, f32::max);
    let min = results.iter().map(|r| r.score).fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        // All scores identical; assign a uniform normalized score.
        return results.iter().map(|r| (r.id.clone(), 0.5)).collect();
    }
    let range = max - min;
    results
        .iter()
        .map(|r| (r.id.clone(), (r.score - min) / range))
        .collect()
}

/// Fuse dense and keyword lists with score-aware RRF.
///
/// `score_weight` controls the blend: 0.0 is pure rank fusion, higher values
/// let the original similarity/BM25 scores pull harder. Output scores are
/// normalized so the best result is 1.0.
pub fn score_aware_rrf(
    dense: Vec<RetrievedResult>,
    keyword: Vec<RetrievedResult>,
    rrf_k: f32,
    score_weight: f32,
    top_k: usize,
) -> Vec<RetrievedResult> {
    if dense.is_empty() && keyword.is_empty() {
        return Vec::new();
    }

    let dense_norm = normalize_scores(&dense);
    let keyword_norm = normalize_scores(&keyword);

    let mut fused: HashMap<String, (f32, FusionSource, RetrievedResult)> = HashMap::new();

    for (rank, result) in dense.into_iter().enumerate() {
        let rrf = 1.0 / (rrf_k + rank as f32 + 1.0);
        let orig = dense_norm.get(&result.id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig);
        fused
            .entry(result.id.clone())
            .and_modify(|(score, source, _)| {
                *score += combined;
                *source = FusionSource::Both;
            })
            .or_insert((combined, FusionSource::Dense, result));
    }

    for (rank, result) in keyword.into_iter().enumerate() {
        let rrf = 1.0 / (rrf_k + rank as f32 + 1.0);
        let orig = keyword_norm.get(&result.id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig);
        match fused.entry(result.id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let (score, source, kept) = entry.get_mut();
                *score += combined;
                *source = FusionSource::Both;
                // Dense hits carry embeddings; keep that copy but make sure
                // the embedding survives if only the keyword copy has one.
                if kept.embedding.is_none() && result.embedding.is_some() {
                    kept.embedding = result.embedding;
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert((combined, FusionSource::Keyword, result));
            }
        }
    }

    let mut merged: Vec<RetrievedResult> = fused
        .into_values()
        .map(|(score, source, mut result)| {
            result.score = score;
            result
                .metadata
                .insert("fusion".to_string(), source.as_str().to_string());
            result
        })
        .collect();

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);

    // Normalize so downstream thresholds keep meaning.
    if let Some(max_score) = merged.first().map(|r| r.score) {
        if max_score > 0.0 {
            for result in &mut merged {
                result.score /= max_score;
            }
        }
    }

    merged
}

/// Merge result lists from multiple query variants, keeping the best score
/// for each unique chunk. Lists are interleaved round-robin first so every
/// variant contributes to the cut when `limit` truncates.
pub fn merge_variant_results(
    result_sets: Vec<Vec<RetrievedResult>>,
    limit: usize,
) -> Vec<RetrievedResult> {
    if result_sets.is_empty() {
        return Vec::new();
    }
    if result_sets.len() == 1 {
        let mut single = result_sets.into_iter().next().unwrap_or_default();
        single.truncate(limit);
        return single;
    }

    let mut best_by_id: HashMap<String, RetrievedResult> = HashMap::new();
    let mut ordered_ids: Vec<String> = Vec::new();

    let max_len = result_sets.iter().map(|set| set.len()).max().unwrap_or(0);
    for index in 0..max_len {
        for result_set in &result_sets {
            let Some(result) = result_set.get(index) else {
                continue;
            };
            match best_by_id.get(&result.id) {
                Some(existing) if existing.score >= result.score => {}
                _ => {
                    if !best_by_id.contains_key(&result.id) {
                        ordered_ids.push(result.id.clone());
                    }
                    best_by_id.insert(result.id.clone(), result.clone());
                }
            }
        }
    }

    let mut merged: Vec<RetrievedResult> = ordered_ids
        .into_iter()
        .filter_map(|id| best_by_id.remove(&id))
        .collect();

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultOrigin;
    use std::collections::HashMap as StdHashMap;

    fn result(id: &str, score: f32) -> RetrievedResult {
        RetrievedResult {
            id: id.to_string(),
            content: format!("content for {}", id),
            score,
            origin: ResultOrigin::Document {
                document_id: format!("doc-{}", id),
                chunk_index: 0,
            },
            embedding: None,
            metadata: StdHashMap::new(),
        }
    }

    #[test]
    fn test_shared_hits_outrank_single_source_hits() {
        let dense = vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)];
        let keyword = vec![result("b", 12.0), result("d", 8.0)];

        let fused = score_aware_rrf(dense, keyword, 60.0, 0.3, 10);

        assert_eq!(fused[0].id, "b");
        assert_eq!(fused[0].metadata.get("fusion").map(String::as_str), Some("both"));
        assert!((fused[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scores_normalized_to_unit_range() {
        let dense = vec![result("a", 0.9), result("b", 0.5)];
        let fused = score_aware_rrf(dense, Vec::new(), 60.0, 0.3, 10);

        assert!(fused.iter().all(|r| r.score > 0.0 && r.score <= 1.0));
        assert!((fused[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_scores_do_not_produce_nan() {
        let dense = vec![result("a", 0.5), result("b", 0.5)];
        let keyword = vec![result("c", 3.0), result("d", 3.0)];
        let fused = score_aware_rrf(dense, keyword, 60.0, 0.3, 10);

        assert_eq!(fused.len(), 4);
        assert!(fused.iter().all(|r| r.score.is_finite()));
    }

    #[test]
    fn test_empty_lists() {
        assert!(score_aware_rrf(Vec::new(), Vec::new(), 60.0, 0.3, 10).is_empty());
        let only_dense = score_aware_rrf(vec![result("a", 0.9)], Vec::new(), 60.0, 0.3, 10);
        assert_eq!(only_dense.len(), 1);
        assert_eq!(only_dense[0].id, "a");
    }

    #[test]
    fn test_variant_merge_keeps_best_score_per_chunk() {
        let first = vec![result("a", 0.9), result("b", 0.6)];
        let second = vec![result("b", 0.8), result("c", 0.7)];

        let merged = merge_variant_results(vec![first, second], 10);

        assert_eq!(merged.len(), 3);
        let b = merged.iter().find(|r| r.id == "b").unwrap();
        assert!((b.score - 0.8).abs() < 1e-6);
        assert_eq!(merged[0].id, "a");
    }

    #[test]
    fn test_variant_merge_respects_limit() {
        let first = vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)];
        let second = vec![result("d", 0.85), result("e", 0.65)];

        let merged = merge_variant_results(vec![first, second], 3);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[1].id, "d");
    }

    #[test]
    fn test_single_variant_passes_through() {
        let only = vec![result("a", 0.9), result("b", 0.8)];
        let merged = merge_variant_results(vec![only.clone()], 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "a");
    }
}
