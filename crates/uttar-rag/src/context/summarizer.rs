//! Summarization of oversized context spans.
//!
//! Chunks whose token estimate exceeds the configured cutoff are replaced by
//! a short model-written summary focused on the question. Complements the
//! extractive compressor: compression trims sentences, summarization rewrites
//! spans. Any gateway error aborts the whole pass so the stage runner can
//! keep the uncompressed context.

use std::time::Duration;

use crate::context::budget::estimate_tokens;
use crate::context::compressor::CompressionStats;
use crate::gateway::{ChatMessage, CompletionGateway, CompletionParams};
use crate::types::RagContext;

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(15);
const SUMMARY_MAX_TOKENS: usize = 220;

/// Replace oversized document chunks with focused summaries.
///
/// Returns `Ok(None)` when nothing was large enough to summarize.
pub async fn summarize_context(
    completion: &dyn CompletionGateway,
    model: &str,
    context: &mut RagContext,
    over_tokens: usize,
    query: &str,
) -> anyhow::Result<Option<CompressionStats>> {
    let candidates: Vec<usize> = context
        .document_contexts
        .iter()
        .enumerate()
        .filter(|(_, doc)| estimate_tokens(&doc.content) > over_tokens)
        .map(|(idx, _)| idx)
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }

    let original_tokens: usize = context
        .document_contexts
        .iter()
        .map(|d| estimate_tokens(&d.content))
        .sum();

    let params = CompletionParams::new(model)
        .with_temperature(0.2)
        .with_max_tokens(SUMMARY_MAX_TOKENS);

    for idx in candidates {
        let doc = &context.document_contexts[idx];
        let prompt = format!(
            "Summarize the following passage in 3-4 sentences. Keep every fact, \
             number, and name relevant to this question: \"{}\"\n\n\
             Passage:\n{}",
            query, doc.content
        );
        let messages = [ChatMessage::user(prompt)];

        let summary = tokio::time::timeout(SUMMARY_TIMEOUT, completion.complete(&messages, &params))
            .await
            .map_err(|_| anyhow::anyhow!("summarization call timed out"))??;

        let text = summary.text.trim();
        if text.is_empty() {
            anyhow::bail!("summarization returned empty text");
        }
        context.document_contexts[idx].content = text.to_string();
    }

    let compressed_tokens: usize = context
        .document_contexts
        .iter()
        .map(|d| estimate_tokens(&d.content))
        .sum();

    let stats = CompressionStats::new(original_tokens, compressed_tokens, "llm-summary");
    tracing::debug!(
        original = stats.original_tokens,
        compressed = stats.compressed_tokens,
        ratio = stats.ratio,
        "summarized oversized chunks"
    );
    Ok(Some(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Completion, TokenStream};
    use crate::types::DocumentContext;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedSummarizer;

    #[async_trait]
    impl CompletionGateway for FixedSummarizer {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<Completion> {
            Ok(Completion {
                text: "A short summary of the passage.".to_string(),
                usage: Default::default(),
            })
        }

        async fn complete_stream(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<TokenStream> {
            let (_tx, stream) = TokenStream::channel();
            Ok(stream)
        }
    }

    fn doc(content: String) -> DocumentContext {
        DocumentContext {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            document_name: "Doc".to_string(),
            content,
            score: 0.8,
            chunk_index: 0,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_small_chunks_untouched() {
        let mut context = RagContext {
            document_contexts: vec![doc("short content".to_string())],
            ..Default::default()
        };
        let stats = summarize_context(&FixedSummarizer, "m", &mut context, 600, "q")
            .await
            .unwrap();
        assert!(stats.is_none());
        assert_eq!(context.document_contexts[0].content, "short content");
    }

    #[tokio::test]
    async fn test_oversized_chunk_replaced() {
        let mut context = RagContext {
            document_contexts: vec![doc("x".repeat(4000))],
            ..Default::default()
        };
        let stats = summarize_context(&FixedSummarizer, "m", &mut context, 600, "q")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            context.document_contexts[0].content,
            "A short summary of the passage."
        );
        assert!(stats.compressed_tokens < stats.original_tokens);
        assert_eq!(stats.strategy, "llm-summary");
    }
}
