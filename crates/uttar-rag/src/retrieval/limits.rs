//! Dynamic retrieval limits.
//!
//! Decides how many document chunks and web results to request before
//! retrieval runs, from query complexity, the remaining token budget, and the
//! caller's static caps. After the first retrieval wave the plan can be
//! refined once using the observed scores. All paths are infallible; callers
//! that disable dynamic limits use the static caps directly.

use crate::types::RetrievedResult;

/// Rough token cost of one document chunk in the final prompt.
const AVG_CHUNK_TOKENS: usize = 256;
/// Rough token cost of one web snippet in the final prompt.
const AVG_WEB_TOKENS: usize = 180;

/// Average score below which the first wave counts as weak signal.
const WEAK_SIGNAL_SCORE: f32 = 0.45;
/// Average score above which the plan narrows to cut noise.
const STRONG_SIGNAL_SCORE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
}

const COMPARISON_MARKERS: [&str; 6] = [
    "compare",
    "difference",
    "versus",
    " vs ",
    "pros and cons",
    "trade-off",
];

const ANALYTICAL_MARKERS: [&str; 6] = [
    "why",
    "how does",
    "explain",
    "analyze",
    "evaluate",
    "implication",
];

/// Classify a question by how much context answering it will take.
pub fn classify_complexity(query: &str) -> QueryComplexity {
    let lower = query.to_lowercase();
    let words = lower.split_whitespace().count();

    let comparative = COMPARISON_MARKERS.iter().any(|m| lower.contains(m));
    let analytical = ANALYTICAL_MARKERS.iter().any(|m| lower.contains(m));
    let multi_part = lower.matches('?').count() > 1;

    if words >= 18 || comparative || multi_part {
        QueryComplexity::Complex
    } else if words <= 6 && !analytical {
        QueryComplexity::Simple
    } else {
        QueryComplexity::Moderate
    }
}

/// How many results each retrieval arm should request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalLimits {
    pub document_chunks: usize,
    pub web_results: usize,
}

impl RetrievalLimits {
    /// The caller's static caps, used when dynamic limits are disabled or as
    /// the fallback for any planning failure.
    pub fn from_caps(max_document_chunks: usize, max_web_results: usize) -> Self {
        Self {
            document_chunks: max_document_chunks,
            web_results: max_web_results,
        }
    }
}

/// Plan request counts from complexity, budget, and caps.
///
/// The budget share is deliberately conservative: half the remaining tokens
/// for document chunks, a quarter for web snippets, so history and the answer
/// always have room.
pub fn plan_limits(
    query: &str,
    token_budget: usize,
    max_document_chunks: usize,
    max_web_results: usize,
) -> RetrievalLimits {
    let complexity = classify_complexity(query);

    let (base_docs, base_web) = match complexity {
        QueryComplexity::Simple => (5, 2),
        QueryComplexity::Moderate => (8, 3),
        QueryComplexity::Complex => (12, 5),
    };

    let docs_by_budget = (token_budget / 2 / AVG_CHUNK_TOKENS).max(1);
    let web_by_budget = (token_budget / 4 / AVG_WEB_TOKENS).max(1);

    let document_chunks = base_docs.min(docs_by_budget).min(max_document_chunks).max(1);
    let web_results = base_web.min(web_by_budget).min(max_web_results);

    tracing::debug!(
        ?complexity,
        document_chunks,
        web_results,
        token_budget,
        "planned retrieval limits"
    );

    RetrievalLimits {
        document_chunks,
        web_results,
    }
}

/// One refinement pass after the first retrieval wave.
///
/// Weak scores widen the net (more candidates for the fallback re-query to
/// work with); uniformly strong scores narrow it to cut noise. Runs at most
/// once per request.
pub fn refine_limits(
    planned: RetrievalLimits,
    retrieved: &[RetrievedResult],
    max_document_chunks: usize,
    max_web_results: usize,
) -> RetrievalLimits {
    if retrieved.is_empty() {
        return planned;
    }

    let average_score =
        retrieved.iter().map(|r| r.score).sum::<f32>() / retrieved.len() as f32;

    if average_score < WEAK_SIGNAL_SCORE {
        let widened = RetrievalLimits {
            document_chunks: (planned.document_chunks * 3 / 2)
                .clamp(planned.document_chunks, max_document_chunks.max(1)),
            web_results: (planned.web_results + 1).min(max_web_results),
        };
        tracing::debug!(average_score, ?widened, "weak signal, widening limits");
        return widened;
    }

    if average_score >= STRONG_SIGNAL_SCORE && retrieved.len() >= planned.document_chunks {
        let narrowed = RetrievalLimits {
            document_chunks: (planned.document_chunks / 2).max(3).min(planned.document_chunks),
            web_results: planned.web_results,
        };
        tracing::debug!(average_score, ?narrowed, "strong signal, narrowing limits");
        return narrowed;
    }

    planned
}
