use async_trait::async_trait;
use atalaya_core::error::{CodedError, ErrorCode};
use atalaya_core::model::{Chunk, Document, DocumentId, DocumentStatus, ScoredChunk, WorkspaceId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("document not found")]
    NotFound,
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl CodedError for RepoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RepoError::NotFound => ErrorCode::Missing,
            RepoError::InvalidCursor(_) => ErrorCode::Validation,
            RepoError::DimensionMismatch { .. } => ErrorCode::Validation,
            RepoError::Backend(_) => ErrorCode::StorageError,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<DocumentStatus>,
}

#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub next_cursor: Option<String>,
}

/// Outcome of a compare-and-set status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The document was not in any of the expected source states; carries
    /// what was observed instead.
    Observed(DocumentStatus),
}

/// Persistence port for documents and their chunks. Every method carries the
/// workspace id in its predicate where a workspace-owned row is touched.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn save_document(&self, document: Document) -> Result<(), RepoError>;

    async fn update_file_metadata(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        file_name: &str,
        mime_type: &str,
        storage_key: &str,
    ) -> Result<(), RepoError>;

    /// Atomically transitions `document_id` from any status in `from` to
    /// `to`. Contending callers receive the observed status instead of an
    /// error, which makes worker claims idempotent under at-least-once
    /// delivery.
    async fn transition_status(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        from: &[DocumentStatus],
        to: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<TransitionOutcome, RepoError>;

    async fn get_document(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, RepoError>;

    async fn list_documents(
        &self,
        workspace_id: &WorkspaceId,
        filter: &DocumentFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<DocumentPage, RepoError>;

    /// Soft delete: the row stays, retrieval stops seeing its chunks.
    async fn delete_document(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<(), RepoError>;

    async fn delete_chunks(&self, document_id: &DocumentId) -> Result<(), RepoError>;

    async fn save_chunks(
        &self,
        document_id: &DocumentId,
        chunks: Vec<Chunk>,
    ) -> Result<(), RepoError>;

    /// Persists the document row and its chunks in one atomic step.
    async fn save_document_with_chunks(
        &self,
        document: Document,
        chunks: Vec<Chunk>,
    ) -> Result<(), RepoError>;

    async fn count_chunks(&self, document_id: &DocumentId) -> Result<usize, RepoError>;

    /// Top-k chunks by cosine similarity, scoped to the workspace, excluding
    /// archived workspaces and soft-deleted documents. Ties break by chunk
    /// id ascending.
    async fn vector_search(
        &self,
        workspace_id: &WorkspaceId,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError>;

    /// Sparse full-text branch for hybrid retrieval, scoped identically to
    /// `vector_search`.
    async fn text_search(
        &self,
        workspace_id: &WorkspaceId,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError>;
}
