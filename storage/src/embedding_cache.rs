use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("embedding cache error: {0}")]
pub struct CacheError(pub String);

/// Cache port for embedding vectors. Callers treat failures as warnings; a
/// broken cache must never break the pipeline.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, CacheError>;

    async fn set(&self, key: &str, embedding: Vec<f32>) -> Result<(), CacheError>;
}

#[derive(Default)]
pub struct InMemoryEmbeddingCache {
    entries: DashMap<String, Vec<f32>>,
}

impl InMemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, CacheError> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn set(&self, key: &str, embedding: Vec<f32>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), embedding);
        Ok(())
    }
}
