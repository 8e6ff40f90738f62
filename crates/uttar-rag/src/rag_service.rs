//! Request orchestration.
//!
//! `RagService` owns the full question path: validate the request, resolve
//! the topic, run the off-topic pre-check, serve or populate the context
//! cache, run both retrieval arms concurrently, assemble the prompt context,
//! generate the answer, and shape the response envelope. Every optional
//! stage degrades instead of failing; only validation errors and a terminal
//! generation failure reach the caller as errors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::answer::{AnswerEngine, GeneratedAnswer};
use crate::cache::{cache_key, ttl_for_context, user_pattern, ContextCache};
use crate::config::PipelineConfig;
use crate::context::{plan_budget, ContextStack};
use crate::error::{RagError, RagResult};
use crate::gateway::{
    ChatMessage, ChunkStore, CompletionGateway, EmbeddingGateway, TopicInfo, VectorIndexGateway,
    WebSearchGateway,
};
use crate::health::{HealthRegistry, ServiceKind, ServiceStatus};
use crate::recovery::ErrorRecoveryService;
use crate::retrieval::{plan_limits, RetrievalLimits, RetrievalPipeline};
use crate::types::{QuestionRequest, QuestionResponse, RagContext, Source, SourceType};

/// Outcome of the cache probe: a usable context, or a miss carrying the query
/// embedding so the later write does not have to embed again.
enum CacheProbe {
    Hit(RagContext),
    Miss { embedding: Option<Vec<f32>> },
}

pub struct RagService {
    pipeline: RetrievalPipeline,
    stack: ContextStack,
    engine: AnswerEngine,
    cache: Arc<dyn ContextCache>,
    store: Arc<dyn ChunkStore>,
    recovery: Arc<ErrorRecoveryService>,
    registry: Arc<HealthRegistry>,
    config: PipelineConfig,
}

impl RagService {
    pub fn new(
        embedding: Arc<dyn EmbeddingGateway>,
        vector_index: Arc<dyn VectorIndexGateway>,
        web_search: Arc<dyn WebSearchGateway>,
        completion: Arc<dyn CompletionGateway>,
        store: Arc<dyn ChunkStore>,
        cache: Arc<dyn ContextCache>,
        config: PipelineConfig,
    ) -> RagResult<Self> {
        Self::with_registry(
            embedding,
            vector_index,
            web_search,
            completion,
            store,
            cache,
            config,
            Arc::new(HealthRegistry::new()),
        )
    }

    /// Wire the service onto a caller-owned registry so a surrounding
    /// application can share one view of gateway health across services.
    #[allow(clippy::too_many_arguments)]
    pub fn with_registry(
        embedding: Arc<dyn EmbeddingGateway>,
        vector_index: Arc<dyn VectorIndexGateway>,
        web_search: Arc<dyn WebSearchGateway>,
        completion: Arc<dyn CompletionGateway>,
        store: Arc<dyn ChunkStore>,
        cache: Arc<dyn ContextCache>,
        config: PipelineConfig,
        registry: Arc<HealthRegistry>,
    ) -> RagResult<Self> {
        config.validate().map_err(RagError::Configuration)?;

        let recovery = Arc::new(ErrorRecoveryService::new(
            Arc::clone(&registry),
            config.recovery.clone(),
        ));
        let pipeline = RetrievalPipeline::new(
            embedding,
            vector_index,
            web_search,
            Arc::clone(&completion),
            Arc::clone(&store),
            Arc::clone(&recovery),
            config.clone(),
        );
        let stack = ContextStack::new(Arc::clone(&completion), config.context.clone());
        let engine = AnswerEngine::new(
            completion,
            Arc::clone(&recovery),
            config.generation.clone(),
            config.context.clone(),
        );

        Ok(Self {
            pipeline,
            stack,
            engine,
            cache,
            store,
            recovery,
            registry,
            config,
        })
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn recovery(&self) -> &ErrorRecoveryService {
        &self.recovery
    }

    /// Answer one question end to end.
    pub async fn ask(&self, request: QuestionRequest) -> RagResult<QuestionResponse> {
        request.validate()?;
        let mut request = request;

        let topic = self.resolve_topic(&request).await;
        if let Some(topic) = &topic {
            if !self.engine.is_on_topic(&request, topic).await {
                tracing::info!(topic = %topic.name, "question refused as off-topic");
                let refusal = self.engine.refusal(topic);
                return Ok(compose_response(
                    refusal,
                    Vec::new(),
                    false,
                    false,
                    &self.registry,
                ));
            }
        }

        let (context, from_cache, history) = self.gather_context(&request).await;
        if let Some(history) = history {
            request.conversation_history = history;
        }
        let partial = context.partial;

        let model = self.model_for(&request);
        let outcome = self.stack.assemble(context, &request, &model).await;
        let sources = extract_sources(
            &outcome.context,
            self.config.retrieval.citation_score_threshold,
            self.config.context.max_snippet_chars,
        );

        let generated = self
            .engine
            .answer(&request, topic.as_ref(), &outcome.prompt_text, &sources)
            .await?;

        Ok(compose_response(
            generated,
            sources,
            from_cache,
            partial,
            &self.registry,
        ))
    }

    /// Streaming variant: chunks flow to the caller as they arrive, then
    /// `AnswerSession::finish` yields the same response the batch path builds.
    pub async fn ask_stream(&self, request: QuestionRequest) -> RagResult<AnswerSession> {
        request.validate()?;
        let mut request = request;

        let topic = self.resolve_topic(&request).await;
        if let Some(topic) = &topic {
            if !self.engine.is_on_topic(&request, topic).await {
                tracing::info!(topic = %topic.name, "question refused as off-topic");
                return Ok(self.immediate_session(self.engine.refusal(topic), Vec::new(), false));
            }
        }

        let (context, from_cache, history) = self.gather_context(&request).await;
        if let Some(history) = history {
            request.conversation_history = history;
        }
        let partial = context.partial;

        let model = self.model_for(&request);
        let outcome = self.stack.assemble(context, &request, &model).await;
        let sources = extract_sources(
            &outcome.context,
            self.config.retrieval.citation_score_threshold,
            self.config.context.max_snippet_chars,
        );

        let stream = self
            .engine
            .answer_stream(&request, topic.as_ref(), &outcome.prompt_text, sources.clone())
            .await?;

        Ok(AnswerSession {
            chunks: stream.chunks,
            outcome: stream.outcome,
            sources,
            from_cache,
            partial,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Drop every cached context belonging to one tenant. Returns the number
    /// of entries removed.
    pub async fn invalidate_user_cache(&self, user_id: &str) -> RagResult<usize> {
        self.cache
            .delete_pattern(&user_pattern(user_id))
            .await
            .map_err(|err| RagError::upstream(ServiceKind::Cache, err.to_string()))
    }

    pub async fn clear_context_cache(&self) -> RagResult<()> {
        self.cache
            .clear_all()
            .await
            .map_err(|err| RagError::upstream(ServiceKind::Cache, err.to_string()))
    }

    fn model_for(&self, request: &QuestionRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.config.generation.model.clone())
    }

    async fn resolve_topic(&self, request: &QuestionRequest) -> Option<TopicInfo> {
        let topic_id = request.topic_id.as_deref()?;
        let store = Arc::clone(&self.store);
        let id = topic_id.to_string();
        match self
            .recovery
            .retry(ServiceKind::ChunkStore, move || {
                let store = Arc::clone(&store);
                let id = id.clone();
                async move { store.topic(&id).await }
            })
            .await
        {
            Ok(recovered) => {
                if recovered.value.is_none() {
                    tracing::warn!(topic_id, "topic not found, continuing unscoped");
                }
                recovered.value
            }
            Err(err) => {
                tracing::warn!(error = %err, topic_id, "topic lookup failed, continuing unscoped");
                None
            }
        }
    }

    /// Produce the context for one request: cache hit, or retrieval plus a
    /// cache write. The conversation history rides along so its load can
    /// overlap the retrieval arms.
    async fn gather_context(
        &self,
        request: &QuestionRequest,
    ) -> (RagContext, bool, Option<Vec<ChatMessage>>) {
        if !request.enable_document_search
            && !request.enable_keyword_search
            && !request.enable_web_search
        {
            return (RagContext::default(), false, self.load_history(request).await);
        }

        // The cache is bypassed entirely while the registry reports it down.
        let cache_usable =
            !matches!(self.registry.status(ServiceKind::Cache), ServiceStatus::Down);
        let cache_enabled = request.use_cache && self.config.cache.enabled && cache_usable;
        let key = cache_key(request);

        let probe = if cache_enabled {
            self.probe_cache(&key, request).await
        } else {
            CacheProbe::Miss { embedding: None }
        };

        match probe {
            CacheProbe::Hit(context) => (context, true, self.load_history(request).await),
            CacheProbe::Miss { embedding } => {
                let limits = self.plan_request_limits(request);
                let (docs, web, history) = tokio::join!(
                    self.pipeline.retrieve_documents(request, limits),
                    self.pipeline.retrieve_web(request, limits),
                    self.load_history(request),
                );

                let severity = self.registry.overall_status().severity();
                let complete = !docs.failed && !web.failed;
                let context = RagContext {
                    degraded: severity > 0 || !complete,
                    degradation_level: severity,
                    partial: docs.failed != web.failed,
                    document_contexts: docs.items,
                    web_search_results: web.items,
                };

                // Incomplete retrievals are never cached; a later request
                // should get the chance to do better.
                if cache_enabled && complete {
                    self.store_context(&key, request, &context, embedding).await;
                }
                (context, false, history)
            }
        }
    }

    async fn probe_cache(&self, key: &str, request: &QuestionRequest) -> CacheProbe {
        match self.cache.get(key).await {
            Ok(Some(payload)) => {
                self.registry.record_success(ServiceKind::Cache);
                match serde_json::from_str(&payload) {
                    Ok(context) => {
                        tracing::debug!(key, "context served from exact cache key");
                        return CacheProbe::Hit(context);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cached context failed to decode, refetching");
                    }
                }
            }
            Ok(None) => self.registry.record_success(ServiceKind::Cache),
            Err(err) => {
                self.registry.record_failure(ServiceKind::Cache);
                tracing::warn!(error = %err, "cache lookup failed, treating as miss");
            }
        }

        let Some(embedding) = self.pipeline.embed_query(&request.question).await else {
            return CacheProbe::Miss { embedding: None };
        };

        match self
            .cache
            .find_similar(&embedding, self.config.cache.similarity_threshold)
            .await
        {
            Ok(Some(entry)) => {
                self.registry.record_success(ServiceKind::Cache);
                match serde_json::from_str(&entry.value) {
                    Ok(context) => {
                        tracing::debug!(
                            similarity = entry.similarity,
                            "context served from similar cached query"
                        );
                        return CacheProbe::Hit(context);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "similar cached context failed to decode");
                    }
                }
            }
            Ok(None) => self.registry.record_success(ServiceKind::Cache),
            Err(err) => {
                self.registry.record_failure(ServiceKind::Cache);
                tracing::warn!(error = %err, "similarity lookup failed, treating as miss");
            }
        }

        CacheProbe::Miss {
            embedding: Some(embedding),
        }
    }

    async fn store_context(
        &self,
        key: &str,
        request: &QuestionRequest,
        context: &RagContext,
        embedding: Option<Vec<f32>>,
    ) {
        let payload = match serde_json::to_string(context) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "context failed to encode for caching");
                return;
            }
        };
        let ttl = ttl_for_context(&self.config.cache, context, request.cache_ttl_secs);
        match self
            .cache
            .set_with_embedding(key, payload, embedding, ttl)
            .await
        {
            Ok(()) => self.registry.record_success(ServiceKind::Cache),
            Err(err) => {
                self.registry.record_failure(ServiceKind::Cache);
                tracing::warn!(error = %err, "cache write failed, response unaffected");
            }
        }
    }

    fn plan_request_limits(&self, request: &QuestionRequest) -> RetrievalLimits {
        if !request.enable_dynamic_limits {
            return RetrievalLimits::from_caps(request.max_document_chunks, request.max_web_results);
        }
        let budget = request
            .context_token_budget
            .unwrap_or_else(|| plan_budget(&self.config.context, &request.question).context_tokens);
        plan_limits(
            &request.question,
            budget,
            request.max_document_chunks,
            request.max_web_results,
        )
    }

    async fn load_history(&self, request: &QuestionRequest) -> Option<Vec<ChatMessage>> {
        let conversation_id = request.conversation_id.as_deref()?;
        if !request.conversation_history.is_empty() {
            return None;
        }
        let store = Arc::clone(&self.store);
        let id = conversation_id.to_string();
        match self
            .recovery
            .retry(ServiceKind::ChunkStore, move || {
                let store = Arc::clone(&store);
                let id = id.clone();
                async move { store.conversation_history(&id).await }
            })
            .await
        {
            Ok(recovered) => Some(recovered.value),
            Err(err) => {
                tracing::warn!(error = %err, "conversation history load failed, answering without it");
                None
            }
        }
    }

    fn immediate_session(
        &self,
        generated: GeneratedAnswer,
        sources: Vec<Source>,
        from_cache: bool,
    ) -> AnswerSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let (otx, orx) = oneshot::channel();
        let _ = tx.send(generated.answer.clone());
        let _ = otx.send(generated);
        AnswerSession {
            chunks: rx,
            outcome: orx,
            sources,
            from_cache,
            partial: false,
            registry: Arc::clone(&self.registry),
        }
    }
}

/// A streaming answer in flight. Pull `chunks` until it closes, then call
/// [`AnswerSession::finish`] for the full response with citations, sources,
/// and follow-ups. Dropping the whole session cancels the upstream pull.
pub struct AnswerSession {
    pub chunks: mpsc::UnboundedReceiver<String>,
    outcome: oneshot::Receiver<GeneratedAnswer>,
    sources: Vec<Source>,
    from_cache: bool,
    partial: bool,
    registry: Arc<HealthRegistry>,
}

impl AnswerSession {
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    pub async fn finish(self) -> RagResult<QuestionResponse> {
        let generated = self.outcome.await.map_err(|_| {
            RagError::Generation("answer stream ended without a result".to_string())
        })?;
        Ok(compose_response(
            generated,
            self.sources,
            self.from_cache,
            self.partial,
            &self.registry,
        ))
    }
}

/// Derive citable sources from the assembled context: every web result, and
/// document chunks at or above the citation score threshold.
pub fn extract_sources(
    context: &RagContext,
    citation_threshold: f32,
    max_snippet_chars: usize,
) -> Vec<Source> {
    let mut sources = Vec::new();

    for doc in &context.document_contexts {
        if doc.score < citation_threshold {
            continue;
        }
        sources.push(Source {
            source_type: SourceType::Document,
            title: doc.document_name.clone(),
            url: None,
            document_id: Some(doc.document_id.clone()),
            snippet: snippet_of(&doc.content, max_snippet_chars),
            score: doc.score,
            metadata: doc.metadata.clone(),
        });
    }

    for web in &context.web_search_results {
        let mut metadata = HashMap::new();
        if let Some(date) = &web.published_date {
            metadata.insert("publishedDate".to_string(), date.clone());
        }
        if let Some(author) = &web.author {
            metadata.insert("author".to_string(), author.clone());
        }
        sources.push(Source {
            source_type: SourceType::Web,
            title: web.title.clone(),
            url: Some(web.url.clone()),
            document_id: None,
            snippet: snippet_of(&web.content, max_snippet_chars),
            score: web.score,
            metadata,
        });
    }

    sources
}

fn snippet_of(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut: String = content.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

fn compose_response(
    generated: GeneratedAnswer,
    sources: Vec<Source>,
    from_cache: bool,
    partial: bool,
    registry: &HealthRegistry,
) -> QuestionResponse {
    let severity = registry.overall_status().severity();
    QuestionResponse {
        answer: generated.answer,
        sources,
        citations: generated.citations,
        follow_up_questions: generated.follow_up_questions,
        usage: generated.usage,
        degraded: generated.degraded || severity > 0,
        degradation_level: severity,
        partial,
        from_cache,
    }
}
