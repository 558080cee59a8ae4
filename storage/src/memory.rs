use crate::document_repo::{
    DocumentFilter, DocumentPage, DocumentRepository, RepoError, TransitionOutcome,
};
use crate::workspace_repo::WorkspaceRepository;
use async_trait::async_trait;
use atalaya_core::model::{
    Chunk, Document, DocumentId, DocumentStatus, ScoredChunk, Visibility, Workspace, WorkspaceAcl,
    WorkspaceId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Single-process store backing both repository ports, the way one relational
/// database would. Chunk replacement happens under a write lock so no reader
/// ever observes a mix of old and new chunks.
#[derive(Default)]
pub struct InMemoryStore {
    workspaces: DashMap<String, Workspace>,
    documents: DashMap<String, Document>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn workspace_archived(&self, workspace_id: &WorkspaceId) -> bool {
        self.workspaces
            .get(workspace_id.as_str())
            .map(|ws| ws.is_archived())
            .unwrap_or(true)
    }

    fn scoped_document(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Option<Document> {
        self.documents
            .get(document_id.as_str())
            .filter(|doc| &doc.workspace_id == workspace_id)
            .map(|doc| doc.clone())
    }

    async fn search_candidates(&self, workspace_id: &WorkspaceId) -> Vec<(Chunk, String)> {
        if self.workspace_archived(workspace_id) {
            return Vec::new();
        }

        let live_docs: HashMap<String, String> = self
            .documents
            .iter()
            .filter(|entry| {
                let doc = entry.value();
                &doc.workspace_id == workspace_id && !doc.is_deleted()
            })
            .map(|entry| (entry.key().clone(), entry.value().title.clone()))
            .collect();

        let chunks = self.chunks.read().await;
        let mut out = Vec::new();
        for (doc_id, doc_chunks) in chunks.iter() {
            if let Some(title) = live_docs.get(doc_id) {
                for chunk in doc_chunks {
                    out.push((chunk.clone(), title.clone()));
                }
            }
        }
        out
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn rank_and_truncate(mut scored: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.as_str().cmp(b.chunk.id.as_str()))
    });
    scored.truncate(top_k);
    scored
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn parse_cursor(cursor: &str) -> Result<(DateTime<Utc>, String), RepoError> {
    let (ts, id) = cursor
        .split_once('|')
        .ok_or_else(|| RepoError::InvalidCursor(cursor.to_string()))?;
    let ts = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| RepoError::InvalidCursor(cursor.to_string()))?
        .with_timezone(&Utc);
    Ok((ts, id.to_string()))
}

#[async_trait]
impl DocumentRepository for InMemoryStore {
    async fn save_document(&self, document: Document) -> Result<(), RepoError> {
        self.documents
            .insert(document.id.as_str().to_string(), document);
        Ok(())
    }

    async fn update_file_metadata(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        file_name: &str,
        mime_type: &str,
        storage_key: &str,
    ) -> Result<(), RepoError> {
        let mut doc = self
            .documents
            .get_mut(document_id.as_str())
            .filter(|doc| &doc.workspace_id == workspace_id)
            .ok_or(RepoError::NotFound)?;
        doc.file_name = Some(file_name.to_string());
        doc.mime_type = Some(mime_type.to_string());
        doc.storage_key = Some(storage_key.to_string());
        Ok(())
    }

    async fn transition_status(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        from: &[DocumentStatus],
        to: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<TransitionOutcome, RepoError> {
        // The shard lock held by get_mut makes the compare-and-set atomic.
        let mut doc = self
            .documents
            .get_mut(document_id.as_str())
            .filter(|doc| &doc.workspace_id == workspace_id)
            .ok_or(RepoError::NotFound)?;

        if !from.contains(&doc.status) {
            return Ok(TransitionOutcome::Observed(doc.status));
        }

        doc.status = to;
        doc.error_message = error_message;
        Ok(TransitionOutcome::Applied)
    }

    async fn get_document(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, RepoError> {
        Ok(self.scoped_document(workspace_id, document_id))
    }

    async fn list_documents(
        &self,
        workspace_id: &WorkspaceId,
        filter: &DocumentFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<DocumentPage, RepoError> {
        let after = cursor.map(parse_cursor).transpose()?;

        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|entry| {
                let doc = entry.value();
                &doc.workspace_id == workspace_id
                    && !doc.is_deleted()
                    && filter.status.map_or(true, |s| doc.status == s)
            })
            .map(|entry| entry.value().clone())
            .collect();

        docs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        if let Some((ts, id)) = after {
            docs.retain(|doc| {
                (doc.created_at, doc.id.as_str().to_string()) > (ts, id.clone())
            });
        }

        let next_cursor = if docs.len() > limit {
            docs.truncate(limit);
            docs.last()
                .map(|doc| format!("{}|{}", doc.created_at.to_rfc3339(), doc.id))
        } else {
            None
        };

        Ok(DocumentPage {
            documents: docs,
            next_cursor,
        })
    }

    async fn delete_document(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<(), RepoError> {
        let mut doc = self
            .documents
            .get_mut(document_id.as_str())
            .filter(|doc| &doc.workspace_id == workspace_id)
            .ok_or(RepoError::NotFound)?;
        if doc.deleted_at.is_none() {
            doc.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &DocumentId) -> Result<(), RepoError> {
        let mut chunks = self.chunks.write().await;
        chunks.remove(document_id.as_str());
        Ok(())
    }

    async fn save_chunks(
        &self,
        document_id: &DocumentId,
        new_chunks: Vec<Chunk>,
    ) -> Result<(), RepoError> {
        let mut chunks = self.chunks.write().await;
        chunks.insert(document_id.as_str().to_string(), new_chunks);
        Ok(())
    }

    async fn save_document_with_chunks(
        &self,
        document: Document,
        new_chunks: Vec<Chunk>,
    ) -> Result<(), RepoError> {
        let mut chunks = self.chunks.write().await;
        let doc_id = document.id.as_str().to_string();
        self.documents.insert(doc_id.clone(), document);
        chunks.insert(doc_id, new_chunks);
        Ok(())
    }

    async fn count_chunks(&self, document_id: &DocumentId) -> Result<usize, RepoError> {
        let chunks = self.chunks.read().await;
        Ok(chunks
            .get(document_id.as_str())
            .map(|c| c.len())
            .unwrap_or(0))
    }

    async fn vector_search(
        &self,
        workspace_id: &WorkspaceId,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError> {
        let scored = self
            .search_candidates(workspace_id)
            .await
            .into_iter()
            .filter(|(chunk, _)| !chunk.embedding.is_empty())
            .map(|(chunk, document_title)| {
                let score = cosine_similarity(query_embedding, &chunk.embedding);
                ScoredChunk {
                    chunk,
                    score,
                    document_title,
                }
            })
            .collect();

        Ok(rank_and_truncate(scored, top_k))
    }

    async fn text_search(
        &self,
        workspace_id: &WorkspaceId,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepoError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let scored: Vec<ScoredChunk> = self
            .search_candidates(workspace_id)
            .await
            .into_iter()
            .filter_map(|(chunk, document_title)| {
                let chunk_terms = tokenize(&chunk.content);
                if chunk_terms.is_empty() {
                    return None;
                }
                let mut hits = 0usize;
                for term in &terms {
                    hits += chunk_terms.iter().filter(|t| *t == term).count();
                }
                if hits == 0 {
                    return None;
                }
                let score = hits as f32 / (chunk_terms.len() as f32).sqrt();
                Some(ScoredChunk {
                    chunk,
                    score,
                    document_title,
                })
            })
            .collect();

        Ok(rank_and_truncate(scored, top_k))
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryStore {
    async fn save_workspace(&self, workspace: Workspace) -> Result<(), RepoError> {
        self.workspaces
            .insert(workspace.id.as_str().to_string(), workspace);
        Ok(())
    }

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, RepoError> {
        Ok(self.workspaces.get(id.as_str()).map(|ws| ws.clone()))
    }

    async fn list_workspaces(&self, include_archived: bool) -> Result<Vec<Workspace>, RepoError> {
        let mut out: Vec<Workspace> = self
            .workspaces
            .iter()
            .filter(|entry| include_archived || !entry.value().is_archived())
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }

    async fn publish_workspace(
        &self,
        id: &WorkspaceId,
        visibility: Visibility,
    ) -> Result<(), RepoError> {
        let mut ws = self
            .workspaces
            .get_mut(id.as_str())
            .ok_or(RepoError::NotFound)?;
        ws.visibility = visibility;
        Ok(())
    }

    async fn share_workspace(&self, id: &WorkspaceId, acl: WorkspaceAcl) -> Result<(), RepoError> {
        let mut ws = self
            .workspaces
            .get_mut(id.as_str())
            .ok_or(RepoError::NotFound)?;
        ws.acl = Some(acl);
        Ok(())
    }

    async fn archive_workspace(&self, id: &WorkspaceId) -> Result<(), RepoError> {
        let mut ws = self
            .workspaces
            .get_mut(id.as_str())
            .ok_or(RepoError::NotFound)?;
        ws.archive();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atalaya_core::model::UserId;
    use std::sync::Arc;

    async fn seeded_store() -> (Arc<InMemoryStore>, WorkspaceId, Document) {
        let store = Arc::new(InMemoryStore::new());
        let ws = Workspace::new("hr", UserId::from("u1"));
        let ws_id = ws.id.clone();
        store.save_workspace(ws).await.unwrap();

        let doc = Document::new(ws_id.clone(), "policy.pdf", UserId::from("u1"));
        store.save_document(doc.clone()).await.unwrap();
        (store, ws_id, doc)
    }

    fn chunk_with_embedding(doc: &DocumentId, index: u32, content: &str, embedding: Vec<f32>) -> Chunk {
        let mut chunk = Chunk::new(doc.clone(), index, content);
        chunk.embedding = embedding;
        chunk
    }

    #[tokio::test]
    async fn cas_transition_applies_once_under_contention() {
        let (store, ws_id, doc) = seeded_store().await;

        let a = store.transition_status(
            &ws_id,
            &doc.id,
            &[DocumentStatus::Pending, DocumentStatus::Failed],
            DocumentStatus::Processing,
            None,
        );
        let b = store.transition_status(
            &ws_id,
            &doc.id,
            &[DocumentStatus::Pending, DocumentStatus::Failed],
            DocumentStatus::Processing,
            None,
        );

        let (ra, rb) = tokio::join!(a, b);
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, TransitionOutcome::Applied))
            .count();
        assert_eq!(applied, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, TransitionOutcome::Observed(DocumentStatus::Processing))));
    }

    #[tokio::test]
    async fn get_document_is_workspace_scoped() {
        let (store, _ws_id, doc) = seeded_store().await;
        let other = WorkspaceId::from("other");
        assert!(store.get_document(&other, &doc.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_file_metadata_is_workspace_scoped() {
        let (store, ws_id, doc) = seeded_store().await;

        let err = store
            .update_file_metadata(
                &WorkspaceId::from("other"),
                &doc.id,
                "a.txt",
                "text/plain",
                "documents/x/a.txt",
            )
            .await;
        assert!(matches!(err, Err(RepoError::NotFound)));

        store
            .update_file_metadata(&ws_id, &doc.id, "a.txt", "text/plain", "documents/x/a.txt")
            .await
            .unwrap();
        let stored = store.get_document(&ws_id, &doc.id).await.unwrap().unwrap();
        assert_eq!(stored.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(stored.storage_key.as_deref(), Some("documents/x/a.txt"));
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity_then_chunk_id() {
        let (store, ws_id, doc) = seeded_store().await;
        store
            .save_chunks(
                &doc.id,
                vec![
                    chunk_with_embedding(&doc.id, 0, "a", vec![1.0, 0.0]),
                    chunk_with_embedding(&doc.id, 1, "b", vec![0.0, 1.0]),
                    chunk_with_embedding(&doc.id, 2, "c", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.vector_search(&ws_id, &[1.0, 0.0], 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        // The two perfect matches come first, ordered by chunk id.
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].chunk.id.as_str() < hits[1].chunk.id.as_str());
        assert_eq!(hits[2].chunk.chunk_index, 1);
    }

    #[tokio::test]
    async fn search_excludes_archived_workspace() {
        let (store, ws_id, doc) = seeded_store().await;
        store
            .save_chunks(
                &doc.id,
                vec![chunk_with_embedding(&doc.id, 0, "a", vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        store.archive_workspace(&ws_id).await.unwrap();

        let hits = store.vector_search(&ws_id, &[1.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_excludes_soft_deleted_document() {
        let (store, ws_id, doc) = seeded_store().await;
        store
            .save_chunks(
                &doc.id,
                vec![chunk_with_embedding(&doc.id, 0, "vacation days", vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        store.delete_document(&ws_id, &doc.id).await.unwrap();

        assert!(store
            .vector_search(&ws_id, &[1.0, 0.0], 5)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .text_search(&ws_id, "vacation", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn text_search_matches_terms() {
        let (store, ws_id, doc) = seeded_store().await;
        store
            .save_chunks(
                &doc.id,
                vec![
                    chunk_with_embedding(&doc.id, 0, "vacation policy grants days", vec![1.0]),
                    chunk_with_embedding(&doc.id, 1, "expense reports", vec![1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.text_search(&ws_id, "vacation days", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 0);
    }

    #[tokio::test]
    async fn list_documents_paginates_with_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let ws = Workspace::new("hr", UserId::from("u1"));
        let ws_id = ws.id.clone();
        store.save_workspace(ws).await.unwrap();

        for i in 0..5 {
            let doc = Document::new(ws_id.clone(), format!("doc-{}", i), UserId::from("u1"));
            store.save_document(doc).await.unwrap();
        }

        let page1 = store
            .list_documents(&ws_id, &DocumentFilter::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(page1.documents.len(), 2);
        let cursor = page1.next_cursor.expect("more pages");

        let page2 = store
            .list_documents(&ws_id, &DocumentFilter::default(), Some(&cursor), 10)
            .await
            .unwrap();
        assert_eq!(page2.documents.len(), 3);
        assert!(page2.next_cursor.is_none());

        let seen: std::collections::HashSet<String> = page1
            .documents
            .iter()
            .chain(page2.documents.iter())
            .map(|d| d.id.as_str().to_string())
            .collect();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn chunk_replacement_is_atomic() {
        let (store, _ws_id, doc) = seeded_store().await;
        let old: Vec<Chunk> = (0..50)
            .map(|i| chunk_with_embedding(&doc.id, i, "old", vec![1.0]))
            .collect();
        store.save_chunks(&doc.id, old).await.unwrap();

        let store_clone = store.clone();
        let doc_id = doc.id.clone();
        let writer = tokio::spawn(async move {
            let new: Vec<Chunk> = (0..10)
                .map(|i| chunk_with_embedding(&doc_id, i, "new", vec![1.0]))
                .collect();
            store_clone.delete_chunks(&doc_id).await.unwrap();
            store_clone.save_chunks(&doc_id, new).await.unwrap();
        });

        // Observed counts must always be a full generation, never a mix.
        for _ in 0..20 {
            let count = store.count_chunks(&doc.id).await.unwrap();
            assert!(count == 50 || count == 10 || count == 0);
        }
        writer.await.unwrap();
        assert_eq!(store.count_chunks(&doc.id).await.unwrap(), 10);
    }
}
