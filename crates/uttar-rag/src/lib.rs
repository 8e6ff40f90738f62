pub mod answer;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod health;
pub mod rag_service;
pub mod recovery;
pub mod retrieval;
pub mod types;

// Re-export primary types for convenience
pub use config::{
    CacheConfig, ContextConfig, FusionConfig, GenerationConfig, PipelineConfig, RecoveryConfig,
    RetrievalConfig,
};
pub use error::{RagError, RagResult};
pub use rag_service::{extract_sources, AnswerSession, RagService};
pub use types::{
    QuestionRequest, QuestionResponse, RagContext, Source, SourceType, TokenUsage,
};

// Gateway traits and the data they carry; implement these to wire the
// pipeline onto concrete providers.
pub use gateway::{
    ChatMessage, ChunkStore, Completion, CompletionGateway, CompletionParams, DocumentMeta,
    EmbeddingGateway, TokenStream, TopicInfo, VectorFilter, VectorHit, VectorIndexGateway,
    WebSearchGateway, WebSearchHit, WebSearchRequest,
};

pub use cache::{ContextCache, InMemoryContextCache};
pub use health::{CircuitBreaker, HealthRegistry, ServiceKind, ServiceStatus};
pub use recovery::{ErrorRecoveryService, RecoveryStrategy};
