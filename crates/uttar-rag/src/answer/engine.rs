//! Answer generation.
//!
//! The engine takes assembled context plus sources and produces the final
//! answer: one completion call routed through retry and the circuit breaker,
//! then follow-up extraction and citation validation. When generation is
//! down but sources exist, the caller gets a degraded answer listing source
//! titles instead of an error. The streaming variant relays chunks to the
//! client while accumulating them, then runs the same post-processing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::answer::citations::{validate_citations, CitationReport};
use crate::answer::followup::{
    fallback_follow_ups, generate_follow_ups, split_follow_ups, FollowUpParse, FOLLOW_UP_COUNT,
};
use crate::answer::history::{compress_history, format_history, RECENT_TURNS};
use crate::answer::prompts::{
    build_messages, off_topic_check_messages, refusal_answer, refusal_follow_up, AnswerMode,
};
use crate::config::{ContextConfig, GenerationConfig};
use crate::context::budget::{estimate_tokens, plan_budget, truncate_tail_to_budget};
use crate::error::{RagError, RagResult};
use crate::gateway::{CompletionGateway, CompletionParams, TopicInfo};
use crate::health::ServiceKind;
use crate::recovery::ErrorRecoveryService;
use crate::types::{QuestionRequest, Source, TokenUsage};

const OFF_TOPIC_TIMEOUT: Duration = Duration::from_secs(10);
const DEGRADED_SOURCE_LINES: usize = 5;

/// A fully post-processed answer, ready to wrap in a response.
#[derive(Debug)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub follow_up_questions: Vec<String>,
    pub citations: CitationReport,
    pub usage: TokenUsage,
    /// True when this is a source-title fallback, not a model answer.
    pub degraded: bool,
}

/// Streaming answer delivery: chunks for the client, then the processed
/// result once the stream completes. Dropping `chunks` stops emission but
/// post-processing still runs; dropping both ends cancels the upstream pull.
pub struct AnswerStream {
    pub chunks: mpsc::UnboundedReceiver<String>,
    pub outcome: oneshot::Receiver<GeneratedAnswer>,
}

pub struct AnswerEngine {
    completion: Arc<dyn CompletionGateway>,
    recovery: Arc<ErrorRecoveryService>,
    generation: GenerationConfig,
    context_config: ContextConfig,
}

impl AnswerEngine {
    pub fn new(
        completion: Arc<dyn CompletionGateway>,
        recovery: Arc<ErrorRecoveryService>,
        generation: GenerationConfig,
        context_config: ContextConfig,
    ) -> Self {
        Self {
            completion,
            recovery,
            generation,
            context_config,
        }
    }

    fn model_for(&self, request: &QuestionRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.generation.model.clone())
    }

    fn params_for(&self, request: &QuestionRequest) -> CompletionParams {
        CompletionParams::new(self.model_for(request))
            .with_temperature(request.temperature)
            .with_max_tokens(request.max_output_tokens)
    }

    fn history_text(&self, request: &QuestionRequest) -> String {
        if request.conversation_history.is_empty() {
            return String::new();
        }
        let budget = plan_budget(&self.context_config, &request.question).history_tokens;
        let compressed = compress_history(&request.conversation_history, RECENT_TURNS);
        truncate_tail_to_budget(&format_history(&compressed), budget)
    }

    /// Yes/no scope classification. Fails open: any error, timeout, or
    /// unparseable verdict lets the question through.
    pub async fn is_on_topic(&self, request: &QuestionRequest, topic: &TopicInfo) -> bool {
        let enabled = request
            .off_topic_check
            .or(topic.off_topic_check)
            .unwrap_or(true);
        if !enabled {
            return true;
        }

        let messages = off_topic_check_messages(&request.question, topic);
        let params = CompletionParams::new(self.model_for(request))
            .with_temperature(0.0)
            .with_max_tokens(4);

        match tokio::time::timeout(
            OFF_TOPIC_TIMEOUT,
            self.completion.complete(&messages, &params),
        )
        .await
        {
            Ok(Ok(reply)) => {
                let verdict = reply.text.trim().to_ascii_lowercase();
                let on_topic = !verdict.starts_with("no");
                tracing::debug!(topic = %topic.name, on_topic, "off-topic pre-check verdict");
                on_topic
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "off-topic pre-check failed, allowing question");
                true
            }
            Err(_) => {
                tracing::warn!("off-topic pre-check timed out, allowing question");
                true
            }
        }
    }

    /// Canned refusal for an off-topic question: one sentence, one follow-up.
    pub fn refusal(&self, topic: &TopicInfo) -> GeneratedAnswer {
        let answer = refusal_answer(topic);
        let citations = validate_citations(&answer, &[]);
        GeneratedAnswer {
            answer,
            follow_up_questions: vec![refusal_follow_up(topic)],
            citations,
            usage: TokenUsage::default(),
            degraded: false,
        }
    }

    pub async fn answer(
        &self,
        request: &QuestionRequest,
        topic: Option<&TopicInfo>,
        context_text: &str,
        sources: &[Source],
    ) -> RagResult<GeneratedAnswer> {
        let mode = AnswerMode::derive(request, topic);
        let history_text = self.history_text(request);
        let messages = build_messages(mode, topic, context_text, &history_text, &request.question);
        let params = self.params_for(request);
        let timeout = Duration::from_secs(self.generation.request_timeout_secs);

        let outcome = self
            .recovery
            .retry(ServiceKind::Completion, || {
                let completion = Arc::clone(&self.completion);
                let messages = messages.clone();
                let params = params.clone();
                async move {
                    tokio::time::timeout(timeout, completion.complete(&messages, &params))
                        .await
                        .map_err(|_| {
                            anyhow::anyhow!("generation timed out after {}s", timeout.as_secs())
                        })?
                }
            })
            .await;

        match outcome {
            Ok(recovered) => {
                let completion = recovered.value;
                let (answer, follow_ups, citations) =
                    self.post_process(&completion.text, request, sources).await;
                Ok(GeneratedAnswer {
                    answer,
                    follow_up_questions: follow_ups,
                    citations,
                    usage: completion.usage,
                    degraded: false,
                })
            }
            Err(err) if !sources.is_empty() => {
                tracing::warn!(error = %err, "generation exhausted retries, answering from source titles");
                Ok(self.degraded_answer(request, sources))
            }
            Err(err) => Err(RagError::Generation(err.to_string())),
        }
    }

    /// Open a token stream and relay it. The upstream pull continues after a
    /// client disconnect so follow-up extraction and citation validation
    /// still happen, unless the caller dropped the outcome channel too.
    pub async fn answer_stream(
        &self,
        request: &QuestionRequest,
        topic: Option<&TopicInfo>,
        context_text: &str,
        sources: Vec<Source>,
    ) -> RagResult<AnswerStream> {
        let mode = AnswerMode::derive(request, topic);
        let history_text = self.history_text(request);
        let messages = build_messages(mode, topic, context_text, &history_text, &request.question);
        let params = self.params_for(request);
        let timeout = Duration::from_secs(self.generation.request_timeout_secs);

        let opened = self
            .recovery
            .retry(ServiceKind::Completion, || {
                let completion = Arc::clone(&self.completion);
                let messages = messages.clone();
                let params = params.clone();
                async move {
                    tokio::time::timeout(timeout, completion.complete_stream(&messages, &params))
                        .await
                        .map_err(|_| {
                            anyhow::anyhow!(
                                "stream open timed out after {}s",
                                timeout.as_secs()
                            )
                        })?
                }
            })
            .await;

        let mut upstream = match opened {
            Ok(recovered) => recovered.value,
            Err(err) if !sources.is_empty() => {
                tracing::warn!(error = %err, "stream open exhausted retries, answering from source titles");
                let degraded = self.degraded_answer(request, &sources);
                let (tx, rx) = mpsc::unbounded_channel();
                let (otx, orx) = oneshot::channel();
                let _ = tx.send(degraded.answer.clone());
                let _ = otx.send(degraded);
                return Ok(AnswerStream {
                    chunks: rx,
                    outcome: orx,
                });
            }
            Err(err) => return Err(RagError::Generation(err.to_string())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (otx, orx) = oneshot::channel();

        let completion = Arc::clone(&self.completion);
        let model = self.model_for(request);
        let question = request.question.clone();
        let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut client_gone = false;

            while let Some(chunk) = upstream.next().await {
                accumulated.push_str(&chunk);
                if !client_gone && tx.send(chunk).is_err() {
                    client_gone = true;
                    tracing::debug!("client disconnected, stream continues for post-processing");
                }
                if client_gone && otx.is_closed() {
                    tracing::debug!("both receivers gone, abandoning upstream");
                    return;
                }
            }
            drop(tx);

            let (body, parsed) = split_follow_ups(&accumulated);
            let follow_ups = match parsed {
                FollowUpParse::Found(questions) | FollowUpParse::Heuristic(questions) => questions,
                FollowUpParse::None => {
                    generate_follow_ups(
                        completion.as_ref(),
                        &model,
                        &question,
                        &body,
                        FOLLOW_UP_COUNT,
                    )
                    .await
                }
            };
            let citations = validate_citations(&body, &sources);
            let completion_tokens = estimate_tokens(&accumulated);
            let _ = otx.send(GeneratedAnswer {
                answer: body,
                follow_up_questions: follow_ups,
                citations,
                usage: TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                },
                degraded: false,
            });
        });

        Ok(AnswerStream {
            chunks: rx,
            outcome: orx,
        })
    }

    async fn post_process(
        &self,
        raw: &str,
        request: &QuestionRequest,
        sources: &[Source],
    ) -> (String, Vec<String>, CitationReport) {
        let (body, parsed) = split_follow_ups(raw);
        let follow_ups = match parsed {
            FollowUpParse::Found(questions) | FollowUpParse::Heuristic(questions) => questions,
            FollowUpParse::None => {
                generate_follow_ups(
                    self.completion.as_ref(),
                    &self.model_for(request),
                    &request.question,
                    &body,
                    FOLLOW_UP_COUNT,
                )
                .await
            }
        };
        let citations = validate_citations(&body, sources);
        (body, follow_ups, citations)
    }

    /// Answer built from source titles when generation is unavailable.
    fn degraded_answer(&self, request: &QuestionRequest, sources: &[Source]) -> GeneratedAnswer {
        let mut lines = vec![
            "I couldn't generate a full answer right now. These retrieved sources may help:"
                .to_string(),
        ];
        for source in sources.iter().take(DEGRADED_SOURCE_LINES) {
            match source.url.as_deref() {
                Some(url) => lines.push(format!("- {} ({})", source.title, url)),
                None => lines.push(format!("- {}", source.title)),
            }
        }
        let answer = lines.join("\n");
        let citations = validate_citations(&answer, sources);
        GeneratedAnswer {
            answer,
            follow_up_questions: fallback_follow_ups(&request.question, FOLLOW_UP_COUNT),
            citations,
            usage: TokenUsage::default(),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::gateway::{ChatMessage, Completion, TokenStream};
    use crate::health::HealthRegistry;
    use crate::types::SourceType;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGateway {
        reply: Option<String>,
        stream_chunks: Vec<String>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn replying(text: &str) -> Self {
            Self {
                reply: Some(text.to_string()),
                stream_chunks: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                stream_chunks: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn streaming(chunks: &[&str]) -> Self {
            Self {
                reply: Some("unused".to_string()),
                stream_chunks: chunks.iter().map(|c| c.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionGateway for ScriptedGateway {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 20,
                        total_tokens: 30,
                    },
                }),
                None => anyhow::bail!("completion offline"),
            }
        }

        async fn complete_stream(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reply.is_none() {
                anyhow::bail!("completion offline");
            }
            let (tx, stream) = TokenStream::channel();
            let chunks = self.stream_chunks.clone();
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            Ok(stream)
        }
    }

    fn engine_with(gateway: Arc<ScriptedGateway>) -> AnswerEngine {
        let registry = Arc::new(HealthRegistry::new());
        let recovery = Arc::new(ErrorRecoveryService::new(
            registry,
            RecoveryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                ..Default::default()
            },
        ));
        AnswerEngine::new(
            gateway,
            recovery,
            GenerationConfig::default(),
            ContextConfig::default(),
        )
    }

    fn web_source(title: &str, url: &str) -> Source {
        Source {
            source_type: SourceType::Web,
            title: title.to_string(),
            url: Some(url.to_string()),
            document_id: None,
            snippet: "s".to_string(),
            score: 0.7,
            metadata: HashMap::new(),
        }
    }

    fn topic(strict: bool, off_topic_check: Option<bool>) -> TopicInfo {
        TopicInfo {
            id: "t1".to_string(),
            name: "Networking".to_string(),
            description: None,
            strict_scope: strict,
            off_topic_check,
        }
    }

    #[tokio::test]
    async fn test_answer_happy_path() {
        let gateway = Arc::new(ScriptedGateway::replying(
            "TCP retransmits lost segments [RFC overview](https://example.com/rfc).\n\n\
             FOLLOW_UP_QUESTIONS:\n- What is congestion control?\n- How do timeouts work?\n\
             - What is SACK?\n- Why three-way handshake?",
        ));
        let engine = engine_with(Arc::clone(&gateway));
        let request = QuestionRequest::new("how does tcp recover losses?", "u1");
        let sources = vec![web_source("RFC overview", "https://example.com/rfc")];

        let generated = engine
            .answer(&request, None, "some context", &sources)
            .await
            .unwrap();

        assert!(generated.answer.starts_with("TCP retransmits"));
        assert!(!generated.answer.contains("FOLLOW_UP_QUESTIONS"));
        assert_eq!(generated.follow_up_questions.len(), 4);
        assert_eq!(generated.citations.matched, 1);
        assert!(generated.citations.valid);
        assert!(!generated.degraded);
        assert_eq!(generated.usage.total_tokens, 30);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_answer_from_source_titles() {
        let gateway = Arc::new(ScriptedGateway::failing());
        let engine = engine_with(Arc::clone(&gateway));
        let request = QuestionRequest::new("how does tcp recover losses?", "u1");
        let sources = vec![web_source("RFC overview", "https://example.com/rfc")];

        let generated = engine
            .answer(&request, None, "ctx", &sources)
            .await
            .unwrap();

        assert!(generated.degraded);
        assert!(generated.answer.contains("RFC overview"));
        assert_eq!(generated.follow_up_questions.len(), FOLLOW_UP_COUNT);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generation_failure_without_sources_propagates() {
        let gateway = Arc::new(ScriptedGateway::failing());
        let engine = engine_with(gateway);
        let request = QuestionRequest::new("anything?", "u1");

        let err = engine.answer(&request, None, "", &[]).await.unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
    }

    #[tokio::test]
    async fn test_missing_follow_ups_are_generated() {
        let gateway = Arc::new(ScriptedGateway::replying("Just an answer, no block."));
        let engine = engine_with(Arc::clone(&gateway));
        let request = QuestionRequest::new("q?", "u1");

        let generated = engine.answer(&request, None, "ctx", &[]).await.unwrap();
        assert_eq!(generated.follow_up_questions.len(), FOLLOW_UP_COUNT);
        // one generation call + one follow-up call
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_off_topic_verdicts() {
        let deny = Arc::new(ScriptedGateway::replying("no"));
        let engine = engine_with(deny);
        let request = QuestionRequest::new("cooking tips?", "u1");
        assert!(!engine.is_on_topic(&request, &topic(true, None)).await);

        let allow = Arc::new(ScriptedGateway::replying("yes"));
        let engine = engine_with(allow);
        assert!(engine.is_on_topic(&request, &topic(true, None)).await);

        let broken = Arc::new(ScriptedGateway::failing());
        let engine = engine_with(broken);
        assert!(engine.is_on_topic(&request, &topic(true, None)).await);
    }

    #[tokio::test]
    async fn test_off_topic_check_can_be_disabled() {
        let gateway = Arc::new(ScriptedGateway::replying("no"));
        let engine = engine_with(Arc::clone(&gateway));

        let request = QuestionRequest::new("cooking tips?", "u1");
        assert!(engine.is_on_topic(&request, &topic(true, Some(false))).await);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);

        let mut request = QuestionRequest::new("cooking tips?", "u1");
        request.off_topic_check = Some(false);
        assert!(engine.is_on_topic(&request, &topic(true, None)).await);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refusal_has_exactly_one_follow_up() {
        let gateway = Arc::new(ScriptedGateway::failing());
        let engine = engine_with(gateway);
        let refusal = engine.refusal(&topic(true, None));
        assert_eq!(refusal.follow_up_questions.len(), 1);
        assert!(refusal.answer.contains("Networking"));
        assert!(!refusal.degraded);
    }

    #[tokio::test]
    async fn test_streaming_relays_and_post_processes() {
        let gateway = Arc::new(ScriptedGateway::streaming(&[
            "Packets are ",
            "retried.\n\n",
            "FOLLOW_UP_QUESTIONS:\n- One?\n- Two?\n- Three?\n- Four?",
        ]));
        let engine = engine_with(gateway);
        let request = QuestionRequest::new("q?", "u1");

        let mut stream = engine
            .answer_stream(&request, None, "ctx", Vec::new())
            .await
            .unwrap();

        let mut relayed = String::new();
        while let Some(chunk) = stream.chunks.recv().await {
            relayed.push_str(&chunk);
        }
        assert!(relayed.contains("Packets are retried."));

        let generated = stream.outcome.await.unwrap();
        assert_eq!(generated.answer, "Packets are retried.");
        assert_eq!(generated.follow_up_questions.len(), 4);
        assert!(generated.usage.completion_tokens > 0);
    }

    #[tokio::test]
    async fn test_streaming_client_disconnect_still_post_processes() {
        let gateway = Arc::new(ScriptedGateway::streaming(&[
            "Answer body.\n\n",
            "FOLLOW_UP_QUESTIONS:\n- One?\n- Two?\n- Three?\n- Four?",
        ]));
        let engine = engine_with(gateway);
        let request = QuestionRequest::new("q?", "u1");

        let stream = engine
            .answer_stream(&request, None, "ctx", Vec::new())
            .await
            .unwrap();
        drop(stream.chunks);

        let generated = stream.outcome.await.unwrap();
        assert_eq!(generated.answer, "Answer body.");
        assert_eq!(generated.follow_up_questions.len(), 4);
    }

    #[tokio::test]
    async fn test_streaming_open_failure_degrades_with_sources() {
        let gateway = Arc::new(ScriptedGateway::failing());
        let engine = engine_with(gateway);
        let request = QuestionRequest::new("q?", "u1");
        let sources = vec![web_source("Fallback Doc", "https://example.com/doc")];

        let mut stream = engine
            .answer_stream(&request, None, "ctx", sources)
            .await
            .unwrap();

        let chunk = stream.chunks.recv().await.unwrap();
        assert!(chunk.contains("Fallback Doc"));
        let generated = stream.outcome.await.unwrap();
        assert!(generated.degraded);
    }
}
