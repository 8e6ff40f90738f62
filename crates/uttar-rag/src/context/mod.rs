//! Context assembly pipeline.
//!
//! Retrieved context passes through an ordered list of stages, each toggled
//! by the request: relevance ordering, compression, summarization, source
//! prioritization, and token budgeting. Every stage is fault-isolated: a
//! failing stage logs a warning and the pipeline continues with the context
//! it had before that stage. Budgeting always runs last so the prompt can
//! never exceed its window.

use std::future::Future;
use std::sync::Arc;

use crate::config::ContextConfig;
use crate::gateway::CompletionGateway;
use crate::types::{QuestionRequest, RagContext};

pub mod budget;
pub mod compressor;
pub mod format;
pub mod priority;
pub mod summarizer;

pub use budget::{estimate_tokens, fit_context_to_budget, plan_budget, BudgetPlan};
pub use compressor::{compress_chunk, compress_context, CompressionStats};
pub use format::{format_context_for_prompt, DOCUMENT_SECTION_HEADING, WEB_SECTION_HEADING};
pub use priority::{prioritize, PriorityMarks};
pub use summarizer::summarize_context;

/// Run one synchronous stage, keeping the pre-stage context on failure.
pub(crate) fn run_stage<T, F>(name: &'static str, input: T, stage: F) -> T
where
    T: Clone,
    F: FnOnce(T) -> anyhow::Result<T>,
{
    let snapshot = input.clone();
    match stage(input) {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(stage = name, error = %err, "context stage failed, keeping previous context");
            snapshot
        }
    }
}

/// Async counterpart of [`run_stage`].
pub(crate) async fn run_stage_async<T, F, Fut>(name: &'static str, input: T, stage: F) -> T
where
    T: Clone,
    F: FnOnce(T) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let snapshot = input.clone();
    match stage(input).await {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(stage = name, error = %err, "context stage failed, keeping previous context");
            snapshot
        }
    }
}

/// What the stack produced for the prompt builder, plus per-stage stats.
#[derive(Debug)]
pub struct StackOutcome {
    pub context: RagContext,
    pub prompt_text: String,
    pub marks: PriorityMarks,
    pub compression: Option<CompressionStats>,
    pub summarization: Option<CompressionStats>,
    pub dropped_for_budget: usize,
    pub context_tokens: usize,
}

/// Ordered, fault-isolated context processing.
pub struct ContextStack {
    completion: Arc<dyn CompletionGateway>,
    config: ContextConfig,
}

impl ContextStack {
    pub fn new(completion: Arc<dyn CompletionGateway>, config: ContextConfig) -> Self {
        Self { completion, config }
    }

    /// Run every enabled stage in order and render the prompt text.
    pub async fn assemble(
        &self,
        context: RagContext,
        request: &QuestionRequest,
        model: &str,
    ) -> StackOutcome {
        let plan = plan_budget(&self.config, &request.question);
        let context_budget = request.context_token_budget.unwrap_or(plan.context_tokens);

        let mut context = context;

        if request.enable_relevance_ordering {
            context = run_stage("relevance-ordering", context, |mut ctx| {
                ctx.document_contexts.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                ctx.web_search_results.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                Ok(ctx)
            });
        }

        let mut compression = None;
        if request.enable_compression {
            context = run_stage("compression", context, |mut ctx| {
                compression = compress_context(
                    &mut ctx,
                    &request.question,
                    self.config.compression_max_sentences,
                    context_budget,
                );
                Ok(ctx)
            });
        }

        let mut summarization = None;
        if request.enable_summarization {
            let staged = run_stage_async(
                "summarization",
                (context, None),
                |(mut ctx, _): (RagContext, Option<CompressionStats>)| async move {
                    let stats = summarize_context(
                        self.completion.as_ref(),
                        model,
                        &mut ctx,
                        self.config.summarize_over_tokens,
                        &request.question,
                    )
                    .await?;
                    Ok((ctx, stats))
                },
            )
            .await;
            context = staged.0;
            summarization = staged.1;
        }

        let marks = if request.enable_source_prioritization {
            prioritize(&context, self.config.priority_threshold)
        } else {
            PriorityMarks::default()
        };

        // Budgeting is the one stage that always runs: a context that cannot
        // fit the window is never acceptable output.
        let dropped_for_budget = fit_context_to_budget(&mut context, context_budget);

        let prompt_text = format_context_for_prompt(&context, &marks);
        let context_tokens = estimate_tokens(&prompt_text);

        tracing::debug!(
            documents = context.document_contexts.len(),
            web_results = context.web_search_results.len(),
            context_tokens,
            dropped_for_budget,
            "assembled context"
        );

        StackOutcome {
            context,
            prompt_text,
            marks,
            compression,
            summarization,
            dropped_for_budget,
            context_tokens,
        }
    }
}
