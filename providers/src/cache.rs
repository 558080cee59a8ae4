use crate::embedding::{EmbeddingError, EmbeddingService};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storage::embedding_cache::EmbeddingCache;
use tracing::{debug, warn};

/// Bumped whenever `normalize` changes, so stale keys never resolve.
const NORMALIZATION_VERSION: &str = "n1";

const TASK_QUERY: &str = "retrieval_query";
const TASK_DOCUMENT: &str = "retrieval_document";

#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Cache-aside decorator around any embedding provider. Query and document
/// embeddings are partitioned by task type so they never collide; cache
/// failures degrade to provider calls.
pub struct CachedEmbeddingService {
    inner: Arc<dyn EmbeddingService>,
    cache: Arc<dyn EmbeddingCache>,
    counters: Arc<CacheCounters>,
}

impl CachedEmbeddingService {
    pub fn new(inner: Arc<dyn EmbeddingService>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self {
            inner,
            cache,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<CacheCounters> {
        self.counters.clone()
    }

    fn key(&self, task_type: &str, text: &str) -> String {
        format!(
            "{}|{}|{}|{}",
            self.inner.model_id(),
            task_type,
            NORMALIZATION_VERSION,
            normalize(text)
        )
    }

    async fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!("embedding cache get failed: {}", err);
                None
            }
        }
    }

    async fn cache_set(&self, key: &str, embedding: Vec<f32>) {
        if let Err(err) = self.cache.set(key, embedding).await {
            warn!("embedding cache set failed: {}", err);
        }
    }
}

/// Strips and collapses whitespace so formatting differences share an entry.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl EmbeddingService for CachedEmbeddingService {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let key = self.key(TASK_QUERY, text);
        if let Some(hit) = self.cache_get(&key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(metric = "cache_hit", task = TASK_QUERY);
            return Ok(hit);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let embedding = self.inner.embed_query(text).await?;
        self.cache_set(&key, embedding.clone()).await;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() || texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }

        let keys: Vec<String> = texts.iter().map(|t| self.key(TASK_DOCUMENT, t)).collect();
        let mut resolved: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        for key in &keys {
            let hit = self.cache_get(key).await;
            if hit.is_some() {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
            resolved.push(hit);
        }

        // One provider call per unique missing text, regardless of how many
        // positions share it.
        let mut unique_missing: Vec<String> = Vec::new();
        let mut position_of: HashMap<String, usize> = HashMap::new();
        for (i, slot) in resolved.iter().enumerate() {
            if slot.is_none() {
                let normalized = normalize(&texts[i]);
                if !position_of.contains_key(&normalized) {
                    position_of.insert(normalized, unique_missing.len());
                    unique_missing.push(texts[i].clone());
                }
            }
        }

        if !unique_missing.is_empty() {
            let fresh = self.inner.embed_batch(&unique_missing).await?;
            if fresh.len() != unique_missing.len() {
                return Err(EmbeddingError::CardinalityMismatch {
                    expected: unique_missing.len(),
                    got: fresh.len(),
                });
            }

            for (i, slot) in resolved.iter_mut().enumerate() {
                if slot.is_none() {
                    let normalized = normalize(&texts[i]);
                    let idx = position_of[&normalized];
                    *slot = Some(fresh[idx].clone());
                }
            }

            for (text, embedding) in unique_missing.iter().zip(fresh.iter()) {
                let key = self.key(TASK_DOCUMENT, text);
                self.cache_set(&key, embedding.clone()).await;
            }
        }

        Ok(resolved.into_iter().map(|slot| slot.unwrap()).collect())
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
