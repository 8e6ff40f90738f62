//! Extractive context compression.
//!
//! Reduces retrieved chunks to the sentences most relevant to the question,
//! cutting token usage while keeping the extractable facts. Purely local:
//! no model call, no failure mode beyond returning the input unchanged.

use std::collections::HashSet;

use crate::context::budget::estimate_tokens;
use crate::types::RagContext;

/// What a compression or summarization pass did to the context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub ratio: f32,
    pub strategy: &'static str,
}

impl CompressionStats {
    pub fn new(original_tokens: usize, compressed_tokens: usize, strategy: &'static str) -> Self {
        let ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f32 / original_tokens as f32
        };
        Self {
            original_tokens,
            compressed_tokens,
            ratio,
            strategy,
        }
    }
}

/// Compress every document chunk in the context when the total estimate
/// exceeds `budget_tokens`. Web snippets are already short and are left to
/// the budget stage.
pub fn compress_context(
    context: &mut RagContext,
    query: &str,
    max_sentences: usize,
    budget_tokens: usize,
) -> Option<CompressionStats> {
    let original_tokens: usize = context
        .document_contexts
        .iter()
        .map(|d| estimate_tokens(&d.content))
        .sum();

    if original_tokens <= budget_tokens {
        return None;
    }

    for doc in &mut context.document_contexts {
        doc.content = compress_chunk(&doc.content, query, max_sentences);
    }

    let compressed_tokens: usize = context
        .document_contexts
        .iter()
        .map(|d| estimate_tokens(&d.content))
        .sum();

    let stats = CompressionStats::new(original_tokens, compressed_tokens, "extractive");
    tracing::debug!(
        original = stats.original_tokens,
        compressed = stats.compressed_tokens,
        ratio = stats.ratio,
        "compressed document context"
    );
    Some(stats)
}

/// Compress one chunk to its top `max_sentences` query-relevant sentences,
/// in original order. Chunks at or under the limit come back unchanged.
pub fn compress_chunk(chunk: &str, query: &str, max_sentences: usize) -> String {
    let chunk = chunk.trim();
    if chunk.is_empty() {
        return String::new();
    }

    let sentences = split_sentences(chunk);
    if sentences.len() <= max_sentences {
        return chunk.to_string();
    }

    // Keep email addresses and URLs intact as query terms; stripping their
    // punctuation would break exact matching.
    let query_terms: HashSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| {
            if w.contains('@') || w.contains("://") {
                w.trim_matches(|c: char| matches!(c, ',' | '"' | '\'' | '(' | ')'))
                    .to_string()
            } else {
                w.trim_matches(|c: char| !c.is_alphanumeric()).to_string()
            }
        })
        .filter(|w| !w.is_empty())
        .collect();

    let mut scored: Vec<(usize, f32)> = sentences
        .iter()
        .enumerate()
        .map(|(idx, sentence)| {
            (
                idx,
                score_sentence(sentence, &query_terms, idx, sentences.len()),
            )
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut selected: Vec<usize> = scored
        .iter()
        .take(max_sentences)
        .map(|(idx, _)| *idx)
        .collect();
    selected.sort_unstable();

    selected
        .iter()
        .map(|&idx| sentences[idx])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split text into sentences without false splits on decimals or
/// abbreviations. Structured text (three or more non-empty lines) splits on
/// newlines instead.
fn split_sentences(text: &str) -> Vec<&str> {
    if text.contains('\n') && text.lines().count() > 3 {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.len() >= 3 {
            return lines;
        }
    }

    // Boundary: terminator, then whitespace, then an uppercase letter or
    // digit. "3.14" and "e.g. foo" stay whole.
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() {
                let next = chars[j].1;
                if next.is_uppercase() || next.is_ascii_digit() {
                    let sentence = text[start..pos + c.len_utf8()].trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                    start = chars[j].0;
                    i = j;
                    continue;
                }
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    // A single long run without boundaries: fall back to plain period splits.
    if sentences.len() <= 1 && text.len() > 200 {
        let manual: Vec<&str> = text
            .split(". ")
            .flat_map(|s| s.split(".\n"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if manual.len() > 1 {
            return manual;
        }
    }

    sentences
}

/// Score a sentence by query relevance.
///
/// Factors: term overlap (primary), match density, position (first and last
/// sentences often summarize), and a boost for key-value lines and lines
/// carrying extractable identifiers like emails or URLs.
fn score_sentence(
    sentence: &str,
    query_terms: &HashSet<String>,
    position: usize,
    total_sentences: usize,
) -> f32 {
    let lower = sentence.to_lowercase();
    let word_count = lower.split_whitespace().count();
    if word_count == 0 {
        return 0.0;
    }

    let matching_terms = query_terms
        .iter()
        .filter(|term| lower.contains(term.as_str()))
        .count();

    let term_score = if query_terms.is_empty() {
        0.0
    } else {
        matching_terms as f32 / query_terms.len() as f32
    };

    let density = matching_terms as f32 / word_count as f32;

    let position_score = if position == 0 || position == total_sentences - 1 {
        0.1
    } else if position <= 2 {
        0.05
    } else {
        0.0
    };

    let kv_boost = if sentence.contains(':') && sentence.len() < 200 {
        0.15
    } else {
        0.0
    };

    let identifier_boost = if lower.contains('@') || lower.contains("http") {
        0.35
    } else {
        0.0
    };

    term_score * 0.6 + density * 0.15 + position_score + kv_boost + identifier_boost
}
