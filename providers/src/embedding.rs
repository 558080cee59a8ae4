use async_trait::async_trait;
use atalaya_core::error::{CodedError, ErrorCode};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding input must not be empty")]
    EmptyInput,
    #[error("embedding cardinality mismatch: expected {expected}, got {got}")]
    CardinalityMismatch { expected: usize, got: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding provider error: {message}")]
    Provider {
        status: Option<u16>,
        message: String,
    },
}

impl EmbeddingError {
    pub fn status(&self) -> Option<u16> {
        match self {
            EmbeddingError::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

impl CodedError for EmbeddingError {
    fn error_code(&self) -> ErrorCode {
        match self {
            EmbeddingError::EmptyInput => ErrorCode::Validation,
            _ => ErrorCode::EmbeddingError,
        }
    }
}

/// Embedding capability port. Output cardinality equals input cardinality;
/// every vector has the configured dimension.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// Shared output validation for any provider implementation.
pub fn validate_batch_output(
    inputs: usize,
    outputs: &[Vec<f32>],
    dimension: usize,
) -> Result<(), EmbeddingError> {
    if outputs.len() != inputs {
        return Err(EmbeddingError::CardinalityMismatch {
            expected: inputs,
            got: outputs.len(),
        });
    }
    for vector in outputs {
        if vector.len() != dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                got: vector.len(),
            });
        }
    }
    Ok(())
}

/// Hash-seeded embedding: reproducible for identical `(model, text)` inputs,
/// uncorrelated across models.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);
    let mut out = Vec::with_capacity(dims);
    let mut block: u64 = 0;

    while out.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();

        for byte in digest.iter() {
            if out.len() == dims {
                break;
            }
            out.push((*byte as f32 / 127.5) - 1.0);
        }
        block += 1;
    }

    out
}

pub struct FakeEmbedder {
    model_id: String,
    dimension: usize,
}

impl FakeEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(1),
        }
    }
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self::new(
            "text-embedding-004",
            atalaya_core::model::DEFAULT_EMBEDDING_DIMENSION,
        )
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(deterministic_embedding(text, &self.model_id, self.dimension))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() || texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }
        let out: Vec<Vec<f32>> = texts
            .iter()
            .map(|t| deterministic_embedding(t, &self.model_id, self.dimension))
            .collect();
        validate_batch_output(texts.len(), &out, self.dimension)?;
        Ok(out)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
