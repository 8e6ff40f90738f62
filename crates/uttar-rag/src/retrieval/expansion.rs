//! Query expansion: alternate phrasings searched alongside the original.
//!
//! Three strategies. `Heuristic` is rule-based (keyword stripping and
//! synonym substitution) and never fails. `Llm` asks the completion gateway
//! for rephrasings. `Hybrid` tries the LLM and silently falls back to the
//! rules. Expansion failure is always swallowed; the caller gets at least
//! the original query back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::{ChatMessage, CompletionGateway, CompletionParams};

const STOP_WORDS: [&str; 24] = [
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "what", "which", "who", "whom",
    "this", "that", "these", "those", "of", "in", "on", "for", "with", "about", "does",
];

/// Small synonym table for the rule-based variant. Intentionally tiny; the
/// LLM strategy handles anything richer.
const SYNONYMS: [(&str, &str); 8] = [
    ("error", "failure"),
    ("fix", "resolve"),
    ("create", "build"),
    ("delete", "remove"),
    ("fast", "quick"),
    ("cost", "price"),
    ("start", "begin"),
    ("issue", "problem"),
];

const LLM_EXPANSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionStrategy {
    Llm,
    Heuristic,
    Hybrid,
}

/// Expand `query` into up to `max_variants` search strings, the original
/// always first. Never fails.
pub async fn expand(
    query: &str,
    strategy: ExpansionStrategy,
    completion: Option<&Arc<dyn CompletionGateway>>,
    params: &CompletionParams,
    max_variants: usize,
) -> Vec<String> {
    let variants = match strategy {
        ExpansionStrategy::Heuristic => expand_heuristic(query),
        ExpansionStrategy::Llm => match completion {
            Some(gateway) => match expand_with_llm(query, gateway.as_ref(), params).await {
                Ok(variants) => variants,
                Err(err) => {
                    tracing::debug!(error = %err, "LLM expansion failed, using original query");
                    Vec::new()
                }
            },
            None => Vec::new(),
        },
        ExpansionStrategy::Hybrid => match completion {
            Some(gateway) => match expand_with_llm(query, gateway.as_ref(), params).await {
                Ok(variants) if !variants.is_empty() => variants,
                _ => {
                    tracing::debug!("LLM expansion unavailable, falling back to rules");
                    expand_heuristic(query)
                }
            },
            None => expand_heuristic(query),
        },
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(max_variants.max(1));
    for candidate in std::iter::once(query.to_string()).chain(variants) {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
        }
        if out.len() >= max_variants.max(1) {
            break;
        }
    }
    out
}

/// Rule-based variants: a keyword-only form and a synonym-substituted form.
pub fn expand_heuristic(query: &str) -> Vec<String> {
    let mut variants = Vec::new();

    let keywords: Vec<&str> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();
    if keywords.len() >= 2 {
        variants.push(keywords.join(" "));
    }

    let lowered = query.to_lowercase();
    let mut substituted = lowered.clone();
    let mut changed = false;
    for (from, to) in SYNONYMS {
        if substituted
            .split_whitespace()
            .any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == from)
        {
            substituted = substituted
                .split_whitespace()
                .map(|w| {
                    if w.trim_matches(|c: char| !c.is_alphanumeric()) == from {
                        w.replace(from, to)
                    } else {
                        w.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            changed = true;
        }
    }
    if changed && substituted != lowered {
        variants.push(substituted);
    }

    variants
}

/// Ask the completion gateway for alternative phrasings, one per line.
pub async fn expand_with_llm(
    query: &str,
    gateway: &dyn CompletionGateway,
    params: &CompletionParams,
) -> anyhow::Result<Vec<String>> {
    let prompt = format!(
        "Rewrite the following search query two different ways to improve document \
         retrieval. Keep each rewrite short and self-contained. Output exactly two \
         lines, one rewrite per line, with no numbering or commentary.\n\nQuery: {}",
        query
    );

    let messages = [ChatMessage::user(prompt)];
    let params = CompletionParams {
        model: params.model.clone(),
        temperature: 0.7,
        max_tokens: 120,
    };

    let completion =
        tokio::time::timeout(LLM_EXPANSION_TIMEOUT, gateway.complete(&messages, &params))
            .await
            .map_err(|_| anyhow::anyhow!("expansion call timed out"))??;

    let variants: Vec<String> = completion
        .text
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim_start_matches(['-', '*', '•'])
                .trim()
                .trim_matches('"')
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(4)
        .collect();

    Ok(variants)
}
