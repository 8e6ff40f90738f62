use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub candidate_multiplier: usize,
    /// Absolute score floor for document results. Applied after any adaptive
    /// logic; nothing below this ever reaches the context.
    pub hard_min_score: f32,
    /// Document results must clear this to become citable sources.
    pub citation_score_threshold: f32,
    pub factual_threshold: f32,
    pub exploratory_threshold: f32,
    pub threshold_floor: f32,
    pub max_query_variants: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    pub rrf_k: f32,
    /// Weight for original similarity scores in RRF fusion (0.0 = pure RRF,
    /// higher = more score influence).
    pub score_weight: f32,
    /// Word-overlap ratio above which two chunks count as near-duplicates.
    pub near_duplicate_jaccard: f32,
    pub mmr_lambda: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub context_window_tokens: usize,
    pub system_prompt_reserve_tokens: usize,
    pub response_reserve_tokens: usize,
    /// Share of the remaining window given to retrieved context; most of the
    /// rest goes to conversation history.
    pub context_share: f32,
    pub history_share: f32,
    pub compression_max_sentences: usize,
    /// Chunks estimated above this many tokens are summarization candidates.
    pub summarize_over_tokens: usize,
    pub priority_threshold: f32,
    pub max_snippet_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub similarity_threshold: f32,
    /// TTL for contexts containing only document results.
    pub document_ttl_secs: u64,
    /// TTL for contexts containing web results, which go stale faster.
    pub web_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_secs: u64,
}

impl PipelineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.retrieval.default_top_k == 0 {
            return Err("retrieval.default_top_k must be > 0".into());
        }
        if self.retrieval.candidate_multiplier == 0 {
            return Err("retrieval.candidate_multiplier must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.hard_min_score) {
            return Err("retrieval.hard_min_score must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.citation_score_threshold) {
            return Err("retrieval.citation_score_threshold must be in [0.0, 1.0]".into());
        }
        if self.retrieval.threshold_floor > self.retrieval.factual_threshold {
            return Err("retrieval.threshold_floor must not exceed factual_threshold".into());
        }
        if self.retrieval.max_query_variants == 0 {
            return Err("retrieval.max_query_variants must be > 0".into());
        }
        if self.fusion.rrf_k <= 0.0 {
            return Err("fusion.rrf_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.fusion.near_duplicate_jaccard) {
            return Err("fusion.near_duplicate_jaccard must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.fusion.mmr_lambda) {
            return Err("fusion.mmr_lambda must be in [0.0, 1.0]".into());
        }
        if self.context.context_window_tokens < 1024 {
            return Err("context.context_window_tokens must be >= 1024".into());
        }
        if self.context.context_share + self.context.history_share > 1.0 {
            return Err("context.context_share + history_share must not exceed 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err("cache.similarity_threshold must be in [0.0, 1.0]".into());
        }
        if self.cache.capacity == 0 {
            return Err("cache.capacity must be > 0".into());
        }
        if self.generation.model.is_empty() {
            return Err("generation.model must not be empty".into());
        }
        if self.recovery.max_attempts == 0 {
            return Err("recovery.max_attempts must be > 0".into());
        }
        if self.recovery.base_delay_ms > self.recovery.max_delay_ms {
            return Err("recovery.base_delay_ms must not exceed max_delay_ms".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing sections.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            candidate_multiplier: 3,
            hard_min_score: 0.25,
            citation_score_threshold: 0.6,
            factual_threshold: 0.45,
            exploratory_threshold: 0.3,
            threshold_floor: 0.25,
            max_query_variants: 3,
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            score_weight: 0.3,
            near_duplicate_jaccard: 0.85,
            mmr_lambda: 0.7,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 16384,
            system_prompt_reserve_tokens: 2000,
            response_reserve_tokens: 4096,
            context_share: 0.6,
            history_share: 0.25,
            compression_max_sentences: 5,
            summarize_over_tokens: 600,
            priority_threshold: 0.7,
            max_snippet_chars: 300,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
            similarity_threshold: 0.85,
            document_ttl_secs: 3600,
            web_ttl_secs: 900,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_output_tokens: 1024,
            request_timeout_secs: 90,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2000,
            breaker_failure_threshold: 5,
            breaker_reset_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.default_top_k, 10);
        assert!(config.cache.web_ttl_secs < config.cache.document_ttl_secs);
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut config = PipelineConfig::default();
        config.retrieval.hard_min_score = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.fusion.rrf_k = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.context.context_share = 0.9;
        config.context.history_share = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let parsed: PipelineConfig =
            serde_json::from_str(r#"{"cache": {"enabled": false, "capacity": 16, "similarity_threshold": 0.9, "document_ttl_secs": 60, "web_ttl_secs": 30}}"#)
                .unwrap();
        assert!(!parsed.cache.enabled);
        assert_eq!(parsed.cache.capacity, 16);
        assert_eq!(parsed.retrieval.default_top_k, 10);
    }
}
