//! Retrieval pipeline: query shaping, dense and keyword search, fusion, and
//! post-retrieval filtering.
//!
//! The pipeline runs two arms. The document arm expands the query, searches
//! the vector index and the in-process keyword index, fuses the lists, and
//! walks the fused list through threshold cuts, reranking, deduplication, and
//! diversity selection. The web arm forwards the question to the web-search
//! gateway with the caller's filters. Both arms are fault-tolerant: every
//! gateway call goes through the recovery service, and an arm that fails
//! unrecoverably yields an empty list plus a failure flag instead of an error.

pub mod dedup;
pub mod diversity;
pub mod expansion;
pub mod fusion;
pub mod keyword;
pub mod limits;
pub mod rerank;
pub mod threshold;

pub use dedup::{deduplicate_results, DedupReport};
pub use diversity::{cosine_similarity, mmr_select};
pub use expansion::ExpansionStrategy;
pub use fusion::{merge_variant_results, score_aware_rrf};
pub use keyword::Bm25Index;
pub use limits::{classify_complexity, plan_limits, refine_limits, QueryComplexity, RetrievalLimits};
pub use rerank::RerankStrategy;
pub use threshold::{plan_threshold, QueryKind, ThresholdPlan};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::PipelineConfig;
use crate::gateway::{
    ChunkStore, CompletionGateway, CompletionParams, EmbeddingGateway, VectorFilter,
    VectorIndexGateway, WebSearchGateway, WebSearchRequest,
};
use crate::health::ServiceKind;
use crate::recovery::ErrorRecoveryService;
use crate::types::{DocumentContext, QuestionRequest, ResultOrigin, RetrievedResult, WebResult};

const UNKNOWN_DOCUMENT_NAME: &str = "Unknown Document";

/// What one retrieval arm produced. `failed` is set only when the arm was
/// enabled, errored unrecoverably, and has nothing to show for it; an empty
/// list with `failed == false` means the search ran and found nothing.
#[derive(Debug, Clone)]
pub struct ArmOutcome<T> {
    pub items: Vec<T>,
    pub failed: bool,
}

impl<T> Default for ArmOutcome<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failed: false,
        }
    }
}

pub struct RetrievalPipeline {
    embedding: Arc<dyn EmbeddingGateway>,
    vector_index: Arc<dyn VectorIndexGateway>,
    web_search: Arc<dyn WebSearchGateway>,
    completion: Arc<dyn CompletionGateway>,
    store: Arc<dyn ChunkStore>,
    recovery: Arc<ErrorRecoveryService>,
    config: PipelineConfig,
}

impl RetrievalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedding: Arc<dyn EmbeddingGateway>,
        vector_index: Arc<dyn VectorIndexGateway>,
        web_search: Arc<dyn WebSearchGateway>,
        completion: Arc<dyn CompletionGateway>,
        store: Arc<dyn ChunkStore>,
        recovery: Arc<ErrorRecoveryService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            embedding,
            vector_index,
            web_search,
            completion,
            store,
            recovery,
            config,
        }
    }

    fn model_for(&self, request: &QuestionRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.config.generation.model.clone())
    }

    /// Embed the question once, reusing the recovery path. Needed by the
    /// similarity cache as well as dense search.
    pub async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let gateway = Arc::clone(&self.embedding);
        let text = query.to_string();
        match self
            .recovery
            .retry(ServiceKind::Embedding, move || {
                let gateway = Arc::clone(&gateway);
                let text = text.clone();
                async move { gateway.embed(&text).await }
            })
            .await
        {
            Ok(recovered) => Some(recovered.value),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding failed");
                None
            }
        }
    }

    /// Document arm: dense plus keyword retrieval with all post-filters.
    pub async fn retrieve_documents(
        &self,
        request: &QuestionRequest,
        limits: RetrievalLimits,
    ) -> ArmOutcome<DocumentContext> {
        if !request.enable_document_search && !request.enable_keyword_search {
            return ArmOutcome::default();
        }

        let question = request.question.trim();
        let candidate_k = limits
            .document_chunks
            .saturating_mul(self.config.retrieval.candidate_multiplier)
            .max(limits.document_chunks);

        let plan = if request.use_adaptive_threshold {
            plan_threshold(
                question,
                &self.config.retrieval,
                request.min_results,
                request.max_results,
            )
        } else {
            let floor = self
                .config
                .retrieval
                .threshold_floor
                .max(self.config.retrieval.hard_min_score);
            ThresholdPlan {
                initial: request.min_score.max(self.config.retrieval.hard_min_score),
                floor,
                kind: QueryKind::Ambiguous,
            }
        };

        let variants = if request.enable_query_expansion {
            let params = CompletionParams::new(self.model_for(request));
            expansion::expand(
                question,
                request.expansion_strategy,
                Some(&self.completion),
                &params,
                self.config.retrieval.max_query_variants,
            )
            .await
        } else {
            vec![question.to_string()]
        };

        let mut dense_failed = false;
        let mut keyword_failed = false;

        let dense = if request.enable_document_search {
            match self.dense_search(request, &variants, candidate_k).await {
                Ok(results) => results,
                Err(()) => {
                    dense_failed = true;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let keyword = if request.enable_keyword_search {
            match self.keyword_search(request, question, candidate_k).await {
                Ok(results) => results,
                Err(()) => {
                    keyword_failed = true;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Fuse only when both arms delivered; a single list passes through so
        // its scores keep their native meaning.
        let fused = if !dense.is_empty() && !keyword.is_empty() {
            score_aware_rrf(
                dense,
                keyword,
                self.config.fusion.rrf_k,
                self.config.fusion.score_weight,
                candidate_k,
            )
        } else if !dense.is_empty() {
            dense
        } else {
            keyword
        };

        let mut results: Vec<RetrievedResult> = fused
            .iter()
            .filter(|r| r.score >= plan.initial)
            .cloned()
            .collect();

        // One fallback pass: loosen to the floor and widen the dense net.
        if results.len() < request.min_results && request.enable_adaptive_fallback {
            tracing::debug!(
                found = results.len(),
                min_results = request.min_results,
                floor = plan.floor,
                "below minimum, re-querying at threshold floor"
            );
            let mut widened = fused.clone();
            if request.enable_document_search {
                if let Ok(extra) = self
                    .dense_search(request, &[question.to_string()], candidate_k * 2)
                    .await
                {
                    widened = merge_variant_results(vec![widened, extra], candidate_k * 2);
                }
            }
            results = widened
                .into_iter()
                .filter(|r| r.score >= plan.floor)
                .collect();
        }

        // The hard minimum holds no matter what the adaptive logic decided.
        results.retain(|r| r.score >= self.config.retrieval.hard_min_score);

        if results.is_empty() {
            let failed = (dense_failed || keyword_failed)
                && (dense_failed || !request.enable_document_search)
                && (keyword_failed || !request.enable_keyword_search);
            return ArmOutcome {
                items: Vec::new(),
                failed,
            };
        }

        if request.enable_reranking {
            let model = self.model_for(request);
            results = rerank::rerank_results(
                self.completion.as_ref(),
                &model,
                question,
                results,
                request.rerank_strategy,
            )
            .await;
        }

        if request.enable_deduplication {
            let (deduped, report) =
                deduplicate_results(results, self.config.fusion.near_duplicate_jaccard);
            results = deduped;
            if report.total_removed() > 0 {
                tracing::debug!(removed = report.total_removed(), "duplicates dropped");
            }
        }

        let mut keep = limits.document_chunks;
        if request.enable_adaptive_context_selection {
            let refined = refine_limits(
                limits,
                &results,
                request.max_document_chunks,
                request.max_web_results,
            );
            keep = refined.document_chunks;
        }

        if request.enable_diversity_filter {
            results = mmr_select(results, request.diversity_lambda, keep);
        } else {
            results.truncate(keep);
        }

        let items = self.attach_document_meta(results).await;
        ArmOutcome {
            items,
            failed: false,
        }
    }

    /// Web arm: forwards the caller's filters verbatim and stamps each hit
    /// with the retrieval time.
    pub async fn retrieve_web(
        &self,
        request: &QuestionRequest,
        limits: RetrievalLimits,
    ) -> ArmOutcome<WebResult> {
        if !request.enable_web_search || limits.web_results == 0 {
            return ArmOutcome::default();
        }

        let search_request = WebSearchRequest {
            query: request.question.trim().to_string(),
            topic: request.web_topic.clone(),
            time_range: request.time_range.clone(),
            start_date: request.start_date.clone(),
            end_date: request.end_date.clone(),
            country: request.country.clone(),
            max_results: limits.web_results,
        };

        let gateway = Arc::clone(&self.web_search);
        let outcome = self
            .recovery
            .retry(ServiceKind::WebSearch, move || {
                let gateway = Arc::clone(&gateway);
                let search_request = search_request.clone();
                async move { gateway.search(&search_request).await }
            })
            .await;

        match outcome {
            Ok(recovered) => {
                let access_date = Utc::now();
                let mut items: Vec<WebResult> = recovered
                    .value
                    .into_iter()
                    .map(|hit| WebResult {
                        title: hit.title,
                        url: hit.url,
                        content: hit.content,
                        published_date: hit.published_date,
                        author: hit.author,
                        score: hit.score,
                        access_date,
                    })
                    .collect();
                items.truncate(limits.web_results);
                ArmOutcome {
                    items,
                    failed: false,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "web search failed unrecoverably");
                ArmOutcome {
                    items: Vec::new(),
                    failed: true,
                }
            }
        }
    }

    /// Dense search across all query variants, merged into one list.
    /// `Err(())` means the arm failed; an unconfigured index is a no-op.
    async fn dense_search(
        &self,
        request: &QuestionRequest,
        variants: &[String],
        candidate_k: usize,
    ) -> Result<Vec<RetrievedResult>, ()> {
        if !self.vector_index.is_configured() {
            tracing::debug!("vector index not configured, skipping dense search");
            return Ok(Vec::new());
        }

        let embeddings = {
            let gateway = Arc::clone(&self.embedding);
            let texts: Vec<String> = variants.to_vec();
            self.recovery
                .retry(ServiceKind::Embedding, move || {
                    let gateway = Arc::clone(&gateway);
                    let texts = texts.clone();
                    async move { gateway.embed_batch(&texts).await }
                })
                .await
        };

        let embeddings = match embeddings {
            Ok(recovered) => recovered.value,
            Err(err) => {
                tracing::warn!(error = %err, "variant embedding failed");
                return Err(());
            }
        };

        let filter = VectorFilter {
            user_id: request.user_id.clone(),
            topic_id: request.topic_id.clone(),
            document_ids: request.document_ids.clone(),
        };

        let mut result_sets: Vec<Vec<RetrievedResult>> = Vec::with_capacity(embeddings.len());
        let mut any_succeeded = false;
        let mut any_failed = false;

        for embedding in &embeddings {
            let gateway = Arc::clone(&self.vector_index);
            let vector = embedding.clone();
            let filter = filter.clone();
            let outcome = self
                .recovery
                .retry(ServiceKind::VectorIndex, move || {
                    let gateway = Arc::clone(&gateway);
                    let vector = vector.clone();
                    let filter = filter.clone();
                    async move { gateway.search(&vector, &filter, candidate_k).await }
                })
                .await;

            match outcome {
                Ok(recovered) => {
                    any_succeeded = true;
                    let results = recovered
                        .value
                        .into_iter()
                        .map(|hit| RetrievedResult {
                            id: hit.chunk_id,
                            content: hit.content,
                            score: hit.score,
                            origin: ResultOrigin::Document {
                                document_id: hit.document_id,
                                chunk_index: hit.chunk_index,
                            },
                            embedding: None,
                            metadata: hit.metadata,
                        })
                        .collect();
                    result_sets.push(results);
                }
                Err(err) => {
                    any_failed = true;
                    tracing::warn!(error = %err, "dense search variant failed");
                }
            }
        }

        if !any_succeeded && any_failed {
            return Err(());
        }

        Ok(merge_variant_results(result_sets, candidate_k))
    }

    /// Keyword search over the tenant's chunks with a per-request BM25 index.
    /// Scores are scaled by the best hit so thresholds keep meaning.
    async fn keyword_search(
        &self,
        request: &QuestionRequest,
        question: &str,
        candidate_k: usize,
    ) -> Result<Vec<RetrievedResult>, ()> {
        let store = Arc::clone(&self.store);
        let user_id = request.user_id.clone();
        let topic_id = request.topic_id.clone();
        let document_ids = request.document_ids.clone();

        let chunks = match self
            .recovery
            .retry(ServiceKind::ChunkStore, move || {
                let store = Arc::clone(&store);
                let user_id = user_id.clone();
                let topic_id = topic_id.clone();
                let document_ids = document_ids.clone();
                async move {
                    store
                        .chunks_for_user(&user_id, topic_id.as_deref(), document_ids.as_deref())
                        .await
                }
            })
            .await
        {
            Ok(recovered) => recovered.value,
            Err(err) => {
                tracing::warn!(error = %err, "chunk fetch for keyword search failed");
                return Err(());
            }
        };

        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let index = Bm25Index::build(
            chunks,
            self.config.retrieval.bm25_k1,
            self.config.retrieval.bm25_b,
        );
        let hits = index.search(question, candidate_k);
        let max_score = hits.first().map(|(_, s)| *s).unwrap_or(0.0);
        if max_score <= 0.0 {
            return Ok(Vec::new());
        }

        Ok(hits
            .into_iter()
            .map(|(idx, score)| {
                let chunk = index.chunk(idx);
                RetrievedResult {
                    id: chunk.id.clone(),
                    content: chunk.content.clone(),
                    score: score / max_score,
                    origin: ResultOrigin::Document {
                        document_id: chunk.document_id.clone(),
                        chunk_index: chunk.chunk_index,
                    },
                    embedding: None,
                    metadata: HashMap::new(),
                }
            })
            .collect())
    }

    /// Resolve display names for the surviving chunks. A metadata failure
    /// must not drop context, so every unresolved id renders as
    /// "Unknown Document".
    async fn attach_document_meta(&self, results: Vec<RetrievedResult>) -> Vec<DocumentContext> {
        let mut ids: Vec<String> = results
            .iter()
            .filter_map(|r| r.document_id().map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();

        let names: HashMap<String, String> = if ids.is_empty() {
            HashMap::new()
        } else {
            let store = Arc::clone(&self.store);
            let ids_for_fetch = ids.clone();
            match self
                .recovery
                .retry(ServiceKind::ChunkStore, move || {
                    let store = Arc::clone(&store);
                    let ids = ids_for_fetch.clone();
                    async move { store.document_meta(&ids).await }
                })
                .await
            {
                Ok(recovered) => recovered
                    .value
                    .into_iter()
                    .map(|meta| (meta.id, meta.name))
                    .collect(),
                Err(err) => {
                    tracing::warn!(error = %err, "document metadata fetch failed");
                    HashMap::new()
                }
            }
        };

        results
            .into_iter()
            .filter_map(|result| match &result.origin {
                ResultOrigin::Document {
                    document_id,
                    chunk_index,
                } => Some(DocumentContext {
                    chunk_id: result.id.clone(),
                    document_id: document_id.clone(),
                    document_name: names
                        .get(document_id)
                        .cloned()
                        .unwrap_or_else(|| UNKNOWN_DOCUMENT_NAME.to_string()),
                    content: result.content.clone(),
                    score: result.score,
                    chunk_index: *chunk_index,
                    metadata: result.metadata.clone(),
                }),
                ResultOrigin::Web { .. } => None,
            })
            .collect()
    }
}
