//! Context caching.
//!
//! Caching sits in front of retrieval: a hit skips both search arms. Lookup
//! is exact-key first, then embedding similarity, so a reworded question can
//! reuse the context of an equivalent earlier one. Every cache error is
//! treated as a miss by callers; the cache can degrade but never fail a
//! request.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::retrieval::cosine_similarity;
use crate::types::{QuestionRequest, RagContext};

/// A similarity lookup hit.
#[derive(Debug, Clone)]
pub struct SimilarEntry {
    pub key: String,
    pub value: String,
    pub similarity: f32,
}

/// Storage interface for cached context payloads.
///
/// Values are opaque strings; callers serialize what they cache. Entries
/// carry an optional embedding of the question that produced them, which
/// `find_similar` matches against.
#[async_trait]
pub trait ContextCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_embedding(
        &self,
        key: &str,
        value: String,
        embedding: Option<Vec<f32>>,
        ttl: Duration,
    ) -> Result<()>;

    /// Best entry whose stored embedding reaches `threshold`, if any.
    async fn find_similar(&self, embedding: &[f32], threshold: f32) -> Result<Option<SimilarEntry>>;

    /// Delete every key matching a `*`-wildcard pattern. Returns the count.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize>;

    async fn clear_all(&self) -> Result<()>;
}

struct CacheEntry {
    value: String,
    embedding: Option<Vec<f32>>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// LRU-bounded in-process cache.
pub struct InMemoryContextCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl InMemoryContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }
}

#[async_trait]
impl ContextCache for InMemoryContextCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.pop(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_embedding(
        &self,
        key: &str,
        value: String,
        embedding: Option<Vec<f32>>,
        ttl: Duration,
    ) -> Result<()> {
        let entry = CacheEntry {
            value,
            embedding,
            created_at: Instant::now(),
            ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn find_similar(&self, embedding: &[f32], threshold: f32) -> Result<Option<SimilarEntry>> {
        let entries = self.entries.lock();
        let mut best: Option<SimilarEntry> = None;
        for (key, entry) in entries.iter() {
            if entry.expired() {
                continue;
            }
            let Some(stored) = entry.embedding.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(embedding, stored);
            if similarity < threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(SimilarEntry {
                    key: key.clone(),
                    value: entry.value.clone(),
                    similarity,
                });
            }
        }
        Ok(best)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| pattern_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    async fn clear_all(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// `*`-wildcard matching, anchored at both ends.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(after) => rest = after,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Cache key for one request: user scope plus a hash of everything that
/// changes what retrieval returns.
pub fn cache_key(request: &QuestionRequest) -> String {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request.question.hash(&mut hasher);
    request.document_ids.hash(&mut hasher);
    request.enable_document_search.hash(&mut hasher);
    request.enable_keyword_search.hash(&mut hasher);
    request.enable_web_search.hash(&mut hasher);
    request.max_document_chunks.hash(&mut hasher);
    request.max_web_results.hash(&mut hasher);

    let topic = request.topic_id.as_deref().unwrap_or("none");
    format!("ctx:{}:{}:{:x}", request.user_id, topic, hasher.finish())
}

/// Pattern that clears every cached context for one user.
pub fn user_pattern(user_id: &str) -> String {
    format!("ctx:{user_id}:*")
}

/// TTL for a freshly assembled context. Web results go stale faster than
/// documents, so any web content shortens the TTL. A caller override wins.
pub fn ttl_for_context(
    config: &CacheConfig,
    context: &RagContext,
    override_secs: Option<u64>,
) -> Duration {
    if let Some(secs) = override_secs {
        return Duration::from_secs(secs);
    }
    if context.web_search_results.is_empty() {
        Duration::from_secs(config.document_ttl_secs)
    } else {
        Duration::from_secs(config.web_ttl_secs)
    }
}
