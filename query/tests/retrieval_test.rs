use async_trait::async_trait;
use atalaya_core::model::{
    Chunk, ChunkId, Document, DocumentId, DocumentStatus, ScoredChunk, WorkspaceId,
};
use providers::embedding::FakeEmbedder;
use query::search::Retriever;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::document_repo::{
    DocumentFilter, DocumentPage, DocumentRepository, RepoError, TransitionOutcome,
};

/// Repository stub whose sparse branch can be broken on demand.
struct SparseToggleRepo {
    sparse_broken: AtomicBool,
}

impl SparseToggleRepo {
    fn new() -> Self {
        Self {
            sparse_broken: AtomicBool::new(false),
        }
    }

    fn break_sparse(&self) {
        self.sparse_broken.store(true, Ordering::SeqCst);
    }

    fn hit(id: &str, score: f32) -> ScoredChunk {
        let mut chunk = Chunk::new(DocumentId::from("d1"), 0, format!("contenido {}", id));
        chunk.id = ChunkId::from(id);
        ScoredChunk {
            chunk,
            score,
            document_title: "doc".to_string(),
        }
    }
}

#[async_trait]
impl DocumentRepository for SparseToggleRepo {
    async fn save_document(&self, _document: Document) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn update_file_metadata(
        &self,
        _workspace_id: &WorkspaceId,
        _document_id: &DocumentId,
        _file_name: &str,
        _mime_type: &str,
        _storage_key: &str,
    ) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn transition_status(
        &self,
        _workspace_id: &WorkspaceId,
        _document_id: &DocumentId,
        _from: &[DocumentStatus],
        _to: DocumentStatus,
        _error_message: Option<String>,
    ) -> Result<TransitionOutcome, RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn get_document(
        &self,
        _workspace_id: &WorkspaceId,
        _document_id: &DocumentId,
    ) -> Result<Option<Document>, RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn list_documents(
        &self,
        _workspace_id: &WorkspaceId,
        _filter: &DocumentFilter,
        _cursor: Option<&str>,
        _limit: usize,
    ) -> Result<DocumentPage, RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn delete_document(
        &self,
        _workspace_id: &WorkspaceId,
        _document_id: &DocumentId,
    ) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn delete_chunks(&self, _document_id: &DocumentId) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn save_chunks(
        &self,
        _document_id: &DocumentId,
        _chunks: Vec<Chunk>,
    ) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn save_document_with_chunks(
        &self,
        _document: Document,
        _chunks: Vec<Chunk>,
    ) -> Result<(), RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn count_chunks(&self, _document_id: &DocumentId) -> Result<usize, RepoError> {
        unreachable!("not used by retrieval")
    }

    async fn vector_search(
        &self,
        _workspace_id: &WorkspaceId,
        _query_embedding: &[f32],
        _top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError> {
        Ok(vec![Self::hit("a", 0.9), Self::hit("b", 0.8)])
    }

    async fn text_search(
        &self,
        _workspace_id: &WorkspaceId,
        _query: &str,
        _top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError> {
        if self.sparse_broken.load(Ordering::SeqCst) {
            return Err(RepoError::Backend("full-text index offline".to_string()));
        }
        Ok(vec![Self::hit("c", 2.0), Self::hit("a", 1.0)])
    }
}

#[tokio::test]
async fn hybrid_fuses_both_branches_when_healthy() {
    let repo = Arc::new(SparseToggleRepo::new());
    let retriever = Retriever::new(repo, Arc::new(FakeEmbedder::new("m", 8))).with_hybrid(true, 60.0);

    let result = retriever
        .retrieve(&WorkspaceId::from("w1"), "consulta", 3)
        .await
        .unwrap();

    assert!(result.hybrid_used);
    // "a" ranks first: present in both lists.
    assert_eq!(result.chunks[0].chunk.id.as_str(), "a");
    let ids: Vec<&str> = result.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
    assert!(ids.contains(&"c"));
}

#[tokio::test]
async fn hybrid_degrades_to_dense_only_when_sparse_fails() {
    let repo = Arc::new(SparseToggleRepo::new());
    repo.break_sparse();
    let retriever =
        Retriever::new(repo.clone(), Arc::new(FakeEmbedder::new("m", 8))).with_hybrid(true, 60.0);

    let result = retriever
        .retrieve(&WorkspaceId::from("w1"), "consulta", 3)
        .await
        .unwrap();

    assert!(!result.hybrid_used);
    let ids: Vec<&str> = result.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn dense_only_mode_never_touches_the_sparse_branch() {
    let repo = Arc::new(SparseToggleRepo::new());
    repo.break_sparse();
    let retriever = Retriever::new(repo, Arc::new(FakeEmbedder::new("m", 8)));

    let result = retriever
        .retrieve(&WorkspaceId::from("w1"), "consulta", 3)
        .await
        .unwrap();
    assert!(!result.hybrid_used);
    assert_eq!(result.chunks.len(), 2);
}

#[tokio::test]
async fn empty_query_fails_before_search() {
    let repo = Arc::new(SparseToggleRepo::new());
    let retriever = Retriever::new(repo, Arc::new(FakeEmbedder::new("m", 8)));

    let err = retriever
        .retrieve(&WorkspaceId::from("w1"), "   ", 3)
        .await
        .unwrap_err();
    assert_eq!(err.code, atalaya_core::error::ErrorCode::Validation);
}
