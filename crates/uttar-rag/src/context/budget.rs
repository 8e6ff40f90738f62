//! Token estimation and window fitting.
//!
//! Estimates are deliberately cheap (roughly four characters per token) and
//! always rounded up, so a passing budget check cannot be an underestimate by
//! much. Trimming never throws; an overfull context is cut and logged.

use crate::config::ContextConfig;
use crate::types::RagContext;

/// Per-entry formatting overhead (numbering, heading, separators) in tokens.
const ENTRY_OVERHEAD_TOKENS: usize = 20;

/// Rough token estimate, ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Token budgets for one prompt assembly.
#[derive(Debug, Clone, Copy)]
pub struct BudgetPlan {
    pub context_tokens: usize,
    pub history_tokens: usize,
}

/// Split the context window into context and history shares after reserving
/// room for the system prompt, the response, and the question itself.
pub fn plan_budget(config: &ContextConfig, question: &str) -> BudgetPlan {
    let query_budget = estimate_tokens(question) + 100;
    let available = config
        .context_window_tokens
        .saturating_sub(config.system_prompt_reserve_tokens)
        .saturating_sub(config.response_reserve_tokens)
        .saturating_sub(query_budget);

    BudgetPlan {
        context_tokens: (available as f32 * config.context_share) as usize,
        history_tokens: (available as f32 * config.history_share) as usize,
    }
}

/// Estimated prompt cost of the whole retrieved context.
pub fn estimate_context_tokens(context: &RagContext) -> usize {
    let docs: usize = context
        .document_contexts
        .iter()
        .map(|d| estimate_tokens(&d.content) + ENTRY_OVERHEAD_TOKENS)
        .sum();
    let webs: usize = context
        .web_search_results
        .iter()
        .map(|w| estimate_tokens(&w.content) + ENTRY_OVERHEAD_TOKENS)
        .sum();
    docs + webs
}

/// Drop the lowest-scored tail entries until the context fits `max_tokens`.
/// Returns how many entries were dropped. Entries are assumed sorted by
/// relevance, so trimming always eats from the back.
pub fn fit_context_to_budget(context: &mut RagContext, max_tokens: usize) -> usize {
    let mut dropped = 0;
    while estimate_context_tokens(context) > max_tokens {
        let last_doc_score = context.document_contexts.last().map(|d| d.score);
        let last_web_score = context.web_search_results.last().map(|w| w.score);

        match (last_doc_score, last_web_score) {
            (Some(doc), Some(web)) => {
                if doc <= web {
                    context.document_contexts.pop();
                } else {
                    context.web_search_results.pop();
                }
            }
            (Some(_), None) => {
                context.document_contexts.pop();
            }
            (None, Some(_)) => {
                context.web_search_results.pop();
            }
            (None, None) => break,
        }
        dropped += 1;
    }

    if dropped > 0 {
        tracing::warn!(
            dropped,
            max_tokens,
            remaining_docs = context.document_contexts.len(),
            remaining_web = context.web_search_results.len(),
            "context exceeded token budget, trimmed tail entries"
        );
    }
    dropped
}

/// Trim a formatted context string paragraph-wise to the budget. Falls back
/// to a char-boundary cut when even the first paragraph is too large.
pub fn truncate_context_to_budget(context_text: &str, max_tokens: usize) -> String {
    let current = estimate_tokens(context_text);
    if current <= max_tokens {
        return context_text.to_string();
    }

    let chunks: Vec<&str> = context_text.split("\n\n").collect();
    let mut result = String::new();
    let mut used = 0;

    for chunk in chunks {
        let t = estimate_tokens(chunk);
        if used + t > max_tokens {
            break;
        }
        if !result.is_empty() {
            result.push_str("\n\n");
            used += 1;
        }
        result.push_str(chunk);
        used += t;
    }

    if result.is_empty() {
        let max_chars = max_tokens * 4;
        let mut end = max_chars.min(context_text.len());
        while end > 0 && !context_text.is_char_boundary(end) {
            end -= 1;
        }
        return context_text[..end].to_string();
    }

    result
}

/// Trim history text line-wise from the front, keeping the most recent lines.
pub fn truncate_tail_to_budget(text: &str, max_tokens: usize) -> String {
    let current = estimate_tokens(text);
    if current <= max_tokens {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut result_lines: Vec<&str> = Vec::new();
    let mut used = 0;

    for line in lines.iter().rev() {
        let t = estimate_tokens(line);
        if used + t > max_tokens {
            break;
        }
        result_lines.push(line);
        used += t;
    }

    result_lines.reverse();
    result_lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentContext, WebResult};
    use chrono::Utc;
    use std::collections::HashMap;

    fn doc(score: f32, content: &str) -> DocumentContext {
        DocumentContext {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            document_name: "Doc".to_string(),
            content: content.to_string(),
            score,
            chunk_index: 0,
            metadata: HashMap::new(),
        }
    }

    fn web(score: f32, content: &str) -> WebResult {
        WebResult {
            title: "Title".to_string(),
            url: "https://example.com".to_string(),
            content: content.to_string(),
            published_date: None,
            author: None,
            score,
            access_date: Utc::now(),
        }
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_plan_budget_reserves_room() {
        let config = ContextConfig::default();
        let plan = plan_budget(&config, "short question");
        assert!(plan.context_tokens > 0);
        assert!(plan.history_tokens > 0);
        assert!(plan.context_tokens + plan.history_tokens < config.context_window_tokens);
    }

    #[test]
    fn test_fit_drops_lowest_scored_tail() {
        let mut context = RagContext {
            document_contexts: vec![doc(0.9, &"x".repeat(400)), doc(0.5, &"y".repeat(400))],
            web_search_results: vec![web(0.7, &"z".repeat(400))],
            ..Default::default()
        };
        // Each entry is ~100 tokens content + 20 overhead; a 260-token budget
        // forces one drop, and the 0.5 doc goes first.
        let dropped = fit_context_to_budget(&mut context, 260);
        assert_eq!(dropped, 1);
        assert_eq!(context.document_contexts.len(), 1);
        assert_eq!(context.web_search_results.len(), 1);
        assert!((context.document_contexts[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_truncate_keeps_whole_paragraphs() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let out = truncate_context_to_budget(&text, 22);
        assert!(out.contains('a'));
        assert!(out.contains('b'));
        assert!(!out.contains('c'));
    }

    #[test]
    fn test_truncate_falls_back_to_char_cut() {
        let text = "d".repeat(1000);
        let out = truncate_context_to_budget(&text, 10);
        assert_eq!(out.len(), 40);
    }

    #[test]
    fn test_tail_truncation_keeps_recent_lines() {
        let text = "old line one\nold line two\nrecent line";
        let out = truncate_tail_to_budget(text, 4);
        assert_eq!(out, "recent line");
    }
}
