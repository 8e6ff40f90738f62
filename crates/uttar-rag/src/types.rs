//! Shared data types for retrieval, context assembly, and answers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::answer::citations::CitationReport;
use crate::error::RagError;
use crate::gateway::ChatMessage;
use crate::retrieval::expansion::ExpansionStrategy;
use crate::retrieval::rerank::RerankStrategy;

/// One embedded slice of a source document. Immutable once created; deleted
/// together with its parent document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
    pub embedding_id: Option<String>,
}

/// Where a retrieved result came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultOrigin {
    Document {
        document_id: String,
        chunk_index: usize,
    },
    Web {
        url: String,
    },
}

/// A scored hit produced by one retrieval stage. Lives for one request only;
/// the embedding rides along so dedup and diversity passes can reuse it
/// without re-embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedResult {
    pub id: String,
    pub content: String,
    pub score: f32,
    pub origin: ResultOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RetrievedResult {
    pub fn is_document(&self) -> bool {
        matches!(self.origin, ResultOrigin::Document { .. })
    }

    pub fn document_id(&self) -> Option<&str> {
        match &self.origin {
            ResultOrigin::Document { document_id, .. } => Some(document_id),
            ResultOrigin::Web { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.origin {
            ResultOrigin::Web { url } => Some(url),
            ResultOrigin::Document { .. } => None,
        }
    }
}

/// A document chunk selected for the final context, enriched with the parent
/// document's display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContext {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    pub score: f32,
    pub chunk_index: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One web search hit selected for the final context. `access_date` is
/// stamped at retrieval time so citations can state when the page was read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub score: f32,
    pub access_date: DateTime<Utc>,
}

/// Everything retrieved for one question.
///
/// Both vectors are always present: an empty vector means "searched, found
/// nothing", while skipped searches also yield empty vectors with the
/// corresponding toggle recorded upstream. `partial` marks a context where
/// one retrieval arm failed while another succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagContext {
    pub document_contexts: Vec<DocumentContext>,
    pub web_search_results: Vec<WebResult>,
    pub degraded: bool,
    pub degradation_level: u8,
    pub partial: bool,
}

impl RagContext {
    pub fn is_empty(&self) -> bool {
        self.document_contexts.is_empty() && self.web_search_results.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Document,
    Web,
}

/// A citable source derived from the retrieved context. Web results are
/// always included; document chunks only when they clear the citation score
/// threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub snippet: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Token accounting for one completion call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

const MAX_QUESTION_CHARS: usize = 2000;

/// The per-question option bag.
///
/// Every optional pipeline stage has an explicit toggle with a documented
/// default; the struct is validated once at the pipeline entry point and then
/// passed immutably through every stage.
#[derive(Debug, Clone)]
pub struct QuestionRequest {
    pub question: String,
    pub user_id: String,
    pub topic_id: Option<String>,
    pub document_ids: Option<Vec<String>>,
    pub conversation_id: Option<String>,

    // Retrieval arms
    pub enable_document_search: bool,
    pub enable_keyword_search: bool,
    pub enable_web_search: bool,

    // Query expansion
    pub enable_query_expansion: bool,
    pub expansion_strategy: ExpansionStrategy,

    // Thresholds
    pub use_adaptive_threshold: bool,
    pub enable_adaptive_fallback: bool,
    pub min_results: usize,
    pub max_results: usize,
    pub min_score: f32,

    // Static retrieval caps (also the fallback when dynamic limits fail)
    pub max_document_chunks: usize,
    pub max_web_results: usize,

    // Post-retrieval shaping
    pub enable_reranking: bool,
    pub rerank_strategy: RerankStrategy,
    pub enable_deduplication: bool,
    pub enable_diversity_filter: bool,
    pub diversity_lambda: f32,
    pub enable_dynamic_limits: bool,
    pub enable_adaptive_context_selection: bool,

    // Context stack
    pub enable_relevance_ordering: bool,
    pub enable_compression: bool,
    pub enable_summarization: bool,
    pub enable_source_prioritization: bool,
    pub context_token_budget: Option<usize>,

    // Cache
    pub use_cache: bool,
    pub cache_ttl_secs: Option<u64>,

    // Web search filters, forwarded verbatim to the gateway
    pub web_topic: Option<String>,
    pub time_range: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub country: Option<String>,

    // Generation
    pub model: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub conversation_history: Vec<ChatMessage>,
    pub streaming: bool,

    /// Overrides the topic's off-topic pre-check setting when set.
    pub off_topic_check: Option<bool>,
}

impl QuestionRequest {
    pub fn new(question: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            user_id: user_id.into(),
            topic_id: None,
            document_ids: None,
            conversation_id: None,
            enable_document_search: true,
            enable_keyword_search: true,
            enable_web_search: true,
            enable_query_expansion: true,
            expansion_strategy: ExpansionStrategy::Hybrid,
            use_adaptive_threshold: true,
            enable_adaptive_fallback: true,
            min_results: 3,
            max_results: 10,
            min_score: 0.3,
            max_document_chunks: 10,
            max_web_results: 5,
            enable_reranking: true,
            rerank_strategy: RerankStrategy::ScoreBased,
            enable_deduplication: true,
            enable_diversity_filter: false,
            diversity_lambda: 0.7,
            enable_dynamic_limits: true,
            enable_adaptive_context_selection: true,
            enable_relevance_ordering: true,
            enable_compression: true,
            enable_summarization: false,
            enable_source_prioritization: true,
            context_token_budget: None,
            use_cache: true,
            cache_ttl_secs: None,
            web_topic: None,
            time_range: None,
            start_date: None,
            end_date: None,
            country: None,
            model: None,
            temperature: 0.3,
            max_output_tokens: 1024,
            conversation_history: Vec::new(),
            streaming: false,
            off_topic_check: None,
        }
    }

    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    pub fn with_documents(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = Some(document_ids);
        self
    }

    pub fn without_web_search(mut self) -> Self {
        self.enable_web_search = false;
        self
    }

    pub fn without_document_search(mut self) -> Self {
        self.enable_document_search = false;
        self.enable_keyword_search = false;
        self
    }

    /// Validate once at the pipeline entry point; every stage after this
    /// point trusts the request.
    pub fn validate(&self) -> Result<(), RagError> {
        let question = self.question.trim();
        if question.is_empty() {
            return Err(RagError::validation("question must not be empty"));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(RagError::validation(format!(
                "question exceeds {} characters",
                MAX_QUESTION_CHARS
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(RagError::validation("user_id must not be empty"));
        }
        if self.min_results > self.max_results {
            return Err(RagError::validation(
                "min_results must not exceed max_results",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(RagError::validation("min_score must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.diversity_lambda) {
            return Err(RagError::validation(
                "diversity_lambda must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::validation("temperature must be within 0.0..=2.0"));
        }
        if self.max_output_tokens == 0 {
            return Err(RagError::validation("max_output_tokens must be positive"));
        }
        Ok(())
    }
}

/// The caller-visible answer envelope. Constructed once per request and
/// immutable after delivery; streaming callers receive the same shape after
/// the final chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub citations: CitationReport,
    pub follow_up_questions: Vec<String>,
    pub usage: TokenUsage,
    /// Set when any tracked service was unhealthy while this answer was made,
    /// or when the answer itself is a generation fallback.
    pub degraded: bool,
    /// Worst-case service severity at response time: 0 healthy, 1..=3
    /// degraded, 4 down.
    pub degradation_level: u8,
    /// One retrieval arm failed while another succeeded.
    pub partial: bool,
    pub from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_is_valid() {
        let request = QuestionRequest::new("What is retrieval augmented generation?", "user-1");
        assert!(request.validate().is_ok());
        assert!(request.enable_document_search);
        assert!(request.use_cache);
        assert_eq!(request.max_document_chunks, 10);
    }

    #[test]
    fn test_empty_question_rejected() {
        let request = QuestionRequest::new("   ", "user-1");
        let err = request.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_over_length_question_rejected() {
        let request = QuestionRequest::new("q".repeat(2001), "user-1");
        assert!(request.validate().is_err());

        let request = QuestionRequest::new("q".repeat(2000), "user-1");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_bounds_checked() {
        let mut request = QuestionRequest::new("what is ai?", "user-1");
        request.min_results = 20;
        request.max_results = 5;
        assert!(request.validate().is_err());

        let mut request = QuestionRequest::new("what is ai?", "user-1");
        request.diversity_lambda = 1.5;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_rag_context_emptiness() {
        let ctx = RagContext::default();
        assert!(ctx.is_empty());
        assert!(ctx.document_contexts.is_empty());
        assert!(ctx.web_search_results.is_empty());
    }

    #[test]
    fn test_retrieved_result_origin_accessors() {
        let doc = RetrievedResult {
            id: "c1".into(),
            content: "text".into(),
            score: 0.8,
            origin: ResultOrigin::Document {
                document_id: "d1".into(),
                chunk_index: 0,
            },
            embedding: None,
            metadata: HashMap::new(),
        };
        assert!(doc.is_document());
        assert_eq!(doc.document_id(), Some("d1"));
        assert_eq!(doc.url(), None);

        let web = RetrievedResult {
            id: "w1".into(),
            content: "text".into(),
            score: 0.5,
            origin: ResultOrigin::Web {
                url: "https://example.com".into(),
            },
            embedding: None,
            metadata: HashMap::new(),
        };
        assert!(!web.is_document());
        assert_eq!(web.url(), Some("https://example.com"));
    }
}
