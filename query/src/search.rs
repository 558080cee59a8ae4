use atalaya_core::error::{CodedError, ServiceError};
use atalaya_core::model::{ScoredChunk, WorkspaceId};
use providers::embedding::EmbeddingService;
use providers::retry::{run_with_retry, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use storage::document_repo::DocumentRepository;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    /// Observability flag: whether the sparse branch contributed.
    pub hybrid_used: bool,
}

/// Dense retrieval with an optional hybrid (sparse + RRF) mode. The sparse
/// branch degrades to dense-only on failure instead of failing the query.
pub struct Retriever {
    documents: Arc<dyn DocumentRepository>,
    embedder: Arc<dyn EmbeddingService>,
    enable_hybrid: bool,
    rrf_k: f32,
    retry: RetryPolicy,
}

impl Retriever {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            documents,
            embedder,
            enable_hybrid: false,
            rrf_k: 60.0,
            retry: RetryPolicy::no_retry(),
        }
    }

    pub fn with_hybrid(mut self, enabled: bool, rrf_k: f32) -> Self {
        self.enable_hybrid = enabled;
        self.rrf_k = rrf_k;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn retrieve(
        &self,
        workspace_id: &WorkspaceId,
        query: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, ServiceError> {
        let embedding = run_with_retry(self.retry, "embed_query", || {
            self.embedder.embed_query(query)
        })
        .await
        .map_err(|e| e.to_service_error())?;

        let dense = self
            .documents
            .vector_search(workspace_id, &embedding, top_k)
            .await
            .map_err(|e| e.to_service_error())?;

        if !self.enable_hybrid {
            return Ok(RetrievalResult {
                chunks: dense,
                hybrid_used: false,
            });
        }

        match self.documents.text_search(workspace_id, query, top_k).await {
            Ok(sparse) => Ok(RetrievalResult {
                chunks: fuse_rrf(dense, sparse, self.rrf_k, top_k),
                hybrid_used: true,
            }),
            Err(err) => {
                warn!("sparse branch failed, degrading to dense-only: {}", err);
                Ok(RetrievalResult {
                    chunks: dense,
                    hybrid_used: false,
                })
            }
        }
    }
}

/// Reciprocal Rank Fusion over the two ranked lists:
/// `score(c) = Σ 1 / (k + rank_list(c))` with 1-based ranks.
fn fuse_rrf(
    dense: Vec<ScoredChunk>,
    sparse: Vec<ScoredChunk>,
    k: f32,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let mut fused: HashMap<String, (ScoredChunk, f32)> = HashMap::new();

    for (rank, item) in dense.into_iter().enumerate() {
        let contribution = 1.0 / (k + (rank + 1) as f32);
        fused
            .entry(item.chunk.id.as_str().to_string())
            .and_modify(|(_, score)| *score += contribution)
            .or_insert((item, contribution));
    }
    for (rank, item) in sparse.into_iter().enumerate() {
        let contribution = 1.0 / (k + (rank + 1) as f32);
        fused
            .entry(item.chunk.id.as_str().to_string())
            .and_modify(|(_, score)| *score += contribution)
            .or_insert((item, contribution));
    }

    let mut out: Vec<ScoredChunk> = fused
        .into_values()
        .map(|(mut item, score)| {
            item.score = score;
            item
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.as_str().cmp(b.chunk.id.as_str()))
    });
    out.truncate(top_k);
    out
}
