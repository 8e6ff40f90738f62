//! External collaborator interfaces.
//!
//! The pipeline never talks to a concrete vendor directly; every external
//! dependency (embedding, vector index, web search, chat completion, chunk
//! store) is a trait with one production HTTP implementation. Tests swap in
//! scripted in-memory implementations.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DocumentChunk, TokenUsage};

pub mod completion;
pub mod embedding;
pub mod streaming;
pub mod vector_index;
pub mod web_search;

pub use completion::HttpCompletionGateway;
pub use embedding::HttpEmbeddingGateway;
pub use streaming::TokenStream;
pub use vector_index::HttpVectorIndexGateway;
pub use web_search::HttpWebSearchGateway;

/// One turn of a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl CompletionParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.3,
            max_tokens: 1024,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Completion output with token accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Tenant-scoped filter for nearest-neighbor search. `user_id` is mandatory;
/// a query can never cross tenants.
#[derive(Debug, Clone)]
pub struct VectorFilter {
    pub user_id: String,
    pub topic_id: Option<String>,
    pub document_ids: Option<Vec<String>>,
}

impl VectorFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            topic_id: None,
            document_ids: None,
        }
    }
}

/// One nearest-neighbor match.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// Nearest-neighbor search over embedded chunks.
#[async_trait]
pub trait VectorIndexGateway: Send + Sync {
    /// Whether the index is usable at all. An unconfigured index makes dense
    /// retrieval a no-op rather than an error.
    fn is_configured(&self) -> bool {
        true
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        top_k: usize,
    ) -> Result<Vec<VectorHit>>;
}

/// Search filters forwarded verbatim from the question request.
#[derive(Debug, Clone, Default)]
pub struct WebSearchRequest {
    pub query: String,
    pub topic: Option<String>,
    pub time_range: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub country: Option<String>,
    pub max_results: usize,
}

#[derive(Debug, Clone)]
pub struct WebSearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    pub published_date: Option<String>,
    pub author: Option<String>,
    pub score: f32,
}

/// Time- and locale-filterable web search.
#[async_trait]
pub trait WebSearchGateway: Send + Sync {
    async fn search(&self, request: &WebSearchRequest) -> Result<Vec<WebSearchHit>>;
}

/// Chat completion, batch or streaming.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<TokenStream>;
}

/// Display metadata for a stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub name: String,
    pub author: Option<String>,
    pub doc_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Scope configuration of a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Strict topics refuse questions outside their scope.
    pub strict_scope: bool,
    /// Per-topic override for the off-topic pre-check; `None` inherits the
    /// pipeline default.
    pub off_topic_check: Option<bool>,
}

/// Row-store access for chunks, document metadata, topics, and history.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn chunks_by_ids(&self, ids: &[String]) -> Result<Vec<DocumentChunk>>;

    /// All chunks visible to one tenant, optionally narrowed to a topic or an
    /// explicit document set. Feeds the in-process keyword index.
    async fn chunks_for_user(
        &self,
        user_id: &str,
        topic_id: Option<&str>,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<DocumentChunk>>;

    async fn document_meta(&self, ids: &[String]) -> Result<Vec<DocumentMeta>>;

    async fn topic(&self, topic_id: &str) -> Result<Option<TopicInfo>>;

    async fn conversation_history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
}
