//! Re-scoring of the fused result list.
//!
//! Fusion produces scores that are comparable within one request but blind to
//! how well a chunk actually answers the question. The cross-encoder strategy
//! sends numbered snippets to the completion gateway in a single listwise call
//! and asks for a relevance ordering; the score-based strategy is a cheap
//! local blend of retrieval score and query-term overlap.
//!
//! Every strategy is fault-tolerant: on any failure (gateway down, timeout,
//! unparseable output) the pre-rerank ordering is returned unchanged.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::{ChatMessage, CompletionGateway, CompletionParams};
use crate::types::RetrievedResult;

const MAX_RERANK_CANDIDATES: usize = 15;
const RERANK_SNIPPET_CHARS: usize = 300;
const RERANK_OUTPUT_TOKENS: usize = 256;
const RERANK_TIMEOUT: Duration = Duration::from_secs(20);

/// Weight of the original retrieval score in the score-based blend; the
/// remainder goes to query-term overlap.
const SCORE_BLEND_WEIGHT: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RerankStrategy {
    Disabled,
    #[default]
    ScoreBased,
    CrossEncoder,
    Hybrid,
}

/// Rerank the fused list according to `strategy`. Never fails and never drops
/// results below the candidate window.
pub async fn rerank_results(
    completion: &dyn CompletionGateway,
    model: &str,
    query: &str,
    results: Vec<RetrievedResult>,
    strategy: RerankStrategy,
) -> Vec<RetrievedResult> {
    if results.len() <= 1 {
        return results;
    }
    match strategy {
        RerankStrategy::Disabled => results,
        RerankStrategy::ScoreBased => score_based_rerank(query, results),
        RerankStrategy::CrossEncoder => llm_rerank(completion, model, query, results).await,
        RerankStrategy::Hybrid => {
            let scored = score_based_rerank(query, results);
            llm_rerank(completion, model, query, scored).await
        }
    }
}

/// Blend the retrieval score with query-term overlap and re-sort.
///
/// Purely local, so it cannot fail; scores stay in [0, 1] when the inputs do.
pub fn score_based_rerank(query: &str, mut results: Vec<RetrievedResult>) -> Vec<RetrievedResult> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if terms.is_empty() {
        return results;
    }

    for result in &mut results {
        let content = result.content.to_lowercase();
        let matched = terms.iter().filter(|t| content.contains(t.as_str())).count();
        let overlap = matched as f32 / terms.len() as f32;
        result.score = SCORE_BLEND_WEIGHT * result.score + (1.0 - SCORE_BLEND_WEIGHT) * overlap;
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

/// Rerank with a single listwise completion call.
///
/// Sends numbered snippets and asks for a JSON array of indices ordered by
/// relevance. Falls back to the input ordering on any failure.
pub async fn llm_rerank(
    completion: &dyn CompletionGateway,
    model: &str,
    query: &str,
    results: Vec<RetrievedResult>,
) -> Vec<RetrievedResult> {
    if results.len() <= 1 {
        return results;
    }

    let candidate_count = results.len().min(MAX_RERANK_CANDIDATES);

    let snippets: String = results
        .iter()
        .take(candidate_count)
        .enumerate()
        .map(|(i, r)| {
            let truncated: String = r.content.chars().take(RERANK_SNIPPET_CHARS).collect();
            format!("[{}] {}", i + 1, truncated)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "You are a search relevance judge. Given a user query and numbered document snippets, \
         rank the snippets by relevance to the query.\n\n\
         Query: \"{}\"\n\n\
         Snippets:\n{}\n\n\
         Return ONLY a JSON array of snippet numbers ordered from most relevant to least relevant. \
         Include ALL {} snippet numbers. Example: [3, 1, 5, 2, 4]\n\
         Output ONLY the JSON array, nothing else.",
        query, snippets, candidate_count
    );

    let params = CompletionParams::new(model)
        .with_temperature(0.0)
        .with_max_tokens(RERANK_OUTPUT_TOKENS);
    let messages = [ChatMessage::user(prompt)];

    // Reranking is an optimization, not a requirement. If the judge is slow
    // or unreachable, keep the fused order.
    let raw_output = match tokio::time::timeout(
        RERANK_TIMEOUT,
        completion.complete(&messages, &params),
    )
    .await
    {
        Ok(Ok(output)) => output.text,
        Ok(Err(e)) => {
            tracing::warn!("listwise rerank call failed: {}, keeping fused order", e);
            return results;
        }
        Err(_) => {
            tracing::warn!(
                "listwise rerank timed out after {}s, keeping fused order",
                RERANK_TIMEOUT.as_secs()
            );
            return results;
        }
    };

    match parse_ranking(&raw_output, candidate_count) {
        Some(order) => {
            tracing::debug!(order = ?order, "listwise rerank parsed");
            apply_ranking(results, &order)
        }
        None => {
            tracing::warn!(
                output = %raw_output.chars().take(200).collect::<String>(),
                "could not parse rerank output, keeping fused order"
            );
            results
        }
    }
}

/// Parse the judge output into a zero-indexed ranking vector.
///
/// Three-tier strategy:
/// 1. Direct JSON parse of the full output
/// 2. Find `[...]` substring and parse that
/// 3. Extract all integers from raw text, deduplicate
fn parse_ranking(output: &str, expected_count: usize) -> Option<Vec<usize>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(indices) = serde_json::from_str::<Vec<usize>>(trimmed) {
        if validate_ranking(&indices, expected_count) {
            return Some(to_zero_indexed(indices));
        }
    }

    if let Some(start) = trimmed.find('[') {
        if let Some(end) = trimmed[start..].find(']') {
            let slice = &trimmed[start..=start + end];
            if let Ok(indices) = serde_json::from_str::<Vec<usize>>(slice) {
                if validate_ranking(&indices, expected_count) {
                    return Some(to_zero_indexed(indices));
                }
            }
        }
    }

    let numbers: Vec<usize> = trimmed
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(|&n| n >= 1 && n <= expected_count)
        .collect();

    // Accept if we got at least half the expected indices.
    if numbers.len() >= (expected_count + 1) / 2 {
        let mut seen = HashSet::new();
        let deduped: Vec<usize> = numbers
            .into_iter()
            .filter(|n| seen.insert(*n))
            .map(|i| i.saturating_sub(1))
            .collect();
        if !deduped.is_empty() {
            return Some(deduped);
        }
    }

    None
}

fn validate_ranking(indices: &[usize], expected_count: usize) -> bool {
    !indices.is_empty() && indices.iter().all(|&i| i >= 1 && i <= expected_count)
}

fn to_zero_indexed(indices: Vec<usize>) -> Vec<usize> {
    indices.into_iter().map(|i| i.saturating_sub(1)).collect()
}

/// Apply the ranking permutation. Out-of-bounds indices are skipped; results
/// not mentioned in `order` are appended in their original relative order,
/// which preserves the tail beyond the candidate window.
fn apply_ranking(mut results: Vec<RetrievedResult>, order: &[usize]) -> Vec<RetrievedResult> {
    let mut reordered: Vec<RetrievedResult> = Vec::with_capacity(results.len());
    let mut used = HashSet::new();

    for &idx in order {
        if idx < results.len() && !used.contains(&idx) {
            used.insert(idx);
        }
    }

    for &idx in order {
        if idx < results.len() {
            reordered.push(results[idx].clone());
        }
    }

    for (i, result) in results.drain(..).enumerate() {
        if !used.contains(&i) {
            reordered.push(result);
        }
    }

    reordered
}
