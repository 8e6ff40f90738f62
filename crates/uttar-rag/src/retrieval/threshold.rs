//! Adaptive similarity thresholds derived from query characteristics.
//!
//! Factual lookups ("who wrote X", "when did Y happen") tolerate a high
//! cutoff because the answer lives in one or two chunks. Exploratory queries
//! ("explain", "compare", "tell me about") need breadth, so the cutoff drops.
//! The floor never goes below the hard minimum score that keeps nonsense
//! matches out of the context.

use crate::config::RetrievalConfig;

const FACTUAL_STARTERS: [&str; 12] = [
    "what is", "what are", "who", "when", "where", "which", "how many", "how much", "define",
    "did", "does", "is there",
];

const EXPLORATORY_MARKERS: [&str; 10] = [
    "how", "why", "explain", "describe", "compare", "discuss", "tell me about", "overview",
    "summarize", "walk me through",
];

/// Classification of a query's retrieval appetite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Narrow lookup; wants few, highly similar chunks.
    Factual,
    /// Broad question; wants wide coverage.
    Exploratory,
    /// No clear signal either way.
    Ambiguous,
}

/// Thresholds for one retrieval pass.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPlan {
    /// Cutoff for the first pass.
    pub initial: f32,
    /// Cutoff for the single fallback re-query when the first pass comes up
    /// short.
    pub floor: f32,
    pub kind: QueryKind,
}

pub fn classify_query(query: &str) -> QueryKind {
    let normalized = query.trim().to_lowercase();
    let word_count = normalized.split_whitespace().count();

    let factual_start = FACTUAL_STARTERS
        .iter()
        .any(|marker| normalized.starts_with(marker));
    let exploratory = EXPLORATORY_MARKERS
        .iter()
        .any(|marker| normalized.starts_with(marker) || normalized.contains(marker));

    // "what is X" style openers beat the generic exploratory markers, but a
    // long rambling question is exploratory no matter how it starts.
    if factual_start && word_count <= 12 {
        QueryKind::Factual
    } else if exploratory || word_count > 18 {
        QueryKind::Exploratory
    } else {
        QueryKind::Ambiguous
    }
}

/// Compute the adaptive threshold plan for a query.
pub fn plan_threshold(
    query: &str,
    config: &RetrievalConfig,
    min_results: usize,
    max_results: usize,
) -> ThresholdPlan {
    let kind = classify_query(query);

    let mut initial = match kind {
        QueryKind::Factual => config.factual_threshold,
        QueryKind::Exploratory => config.exploratory_threshold,
        QueryKind::Ambiguous => (config.factual_threshold + config.exploratory_threshold) / 2.0,
    };

    // Result-count appetite nudges the cutoff: asking for many results wants
    // a looser net, asking for very few wants a tighter one.
    if max_results >= 15 {
        initial -= 0.05;
    } else if max_results <= 3 && min_results <= 2 {
        initial += 0.05;
    }

    let floor = config.threshold_floor.max(config.hard_min_score);
    let initial = initial.clamp(floor, 0.9);

    ThresholdPlan {
        initial,
        floor,
        kind,
    }
}
