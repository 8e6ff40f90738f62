//! Diversity-aware selection with maximal marginal relevance.
//!
//! MMR = lambda * relevance - (1 - lambda) * max similarity to the already
//! selected set. lambda 1.0 is pure relevance, 0.0 pure diversity.

use crate::retrieval::dedup::jaccard_similarity;
use crate::types::RetrievedResult;

/// Cosine similarity in [-1, 1]; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Pairwise similarity between two results: cosine over embeddings when both
/// carry one, word-overlap otherwise. Keyword-only hits have no embedding.
fn pair_similarity(a: &RetrievedResult, b: &RetrievedResult) -> f32 {
    match (&a.embedding, &b.embedding) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb),
        _ => jaccard_similarity(&a.content, &b.content),
    }
}

/// Greedily select up to `k` results maximizing marginal relevance.
///
/// Candidates arrive sorted by relevance; their `score` is the relevance
/// term. Returns the candidates unchanged when no selection pressure exists.
pub fn mmr_select(results: Vec<RetrievedResult>, lambda: f32, k: usize) -> Vec<RetrievedResult> {
    if results.is_empty() || k == 0 {
        return Vec::new();
    }
    if k >= results.len() {
        return results;
    }

    let mut selected: Vec<RetrievedResult> = Vec::with_capacity(k);
    let mut remaining = results;

    for _ in 0..k {
        if remaining.is_empty() {
            break;
        }

        let mut best_idx = 0;
        let mut best_mmr = f32::NEG_INFINITY;

        for (idx, candidate) in remaining.iter().enumerate() {
            let max_similarity = selected
                .iter()
                .map(|s| pair_similarity(candidate, s))
                .fold(0.0_f32, f32::max);
            let mmr = lambda * candidate.score - (1.0 - lambda) * max_similarity;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = idx;
            }
        }

        selected.push(remaining.remove(best_idx));
    }

    selected
}
