use crate::chunker::{chunk_document, ChunkingConfig};
use crate::injection::annotate_chunk;
use atalaya_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditRecorder};
use atalaya_core::auth::{Actor, WorkspacePolicy};
use atalaya_core::error::{CodedError, ServiceError};
use atalaya_core::model::{
    Document, DocumentId, DocumentStatus, Workspace, WorkspaceId,
};
use atalaya_core::quota::{QuotaLimiter, QuotaResource, QuotaScope};
use jobs::queue::DocumentProcessingQueue;
use providers::embedding::{validate_batch_output, EmbeddingService};
use providers::retry::{run_with_retry, RetryPolicy};
use std::sync::Arc;
use storage::document_repo::DocumentRepository;
use storage::file_storage::FileStorage;
use storage::workspace_repo::WorkspaceRepository;
use tracing::warn;

/// Write-side use cases: upload, direct text ingest, reprocess, cancel and
/// delete. Every one resolves the workspace through the write policy before
/// touching anything it owns.
pub struct IngestionService {
    workspaces: Arc<dyn WorkspaceRepository>,
    documents: Arc<dyn DocumentRepository>,
    storage: Option<Arc<dyn FileStorage>>,
    queue: Option<Arc<dyn DocumentProcessingQueue>>,
    embedder: Arc<dyn EmbeddingService>,
    chunking: ChunkingConfig,
    quota: Option<Arc<dyn QuotaLimiter>>,
    audit: AuditRecorder,
    retry: RetryPolicy,
}

impl IngestionService {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        documents: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            workspaces,
            documents,
            storage: None,
            queue: None,
            embedder,
            chunking: ChunkingConfig::default(),
            quota: None,
            audit: AuditRecorder::disabled(),
            retry: RetryPolicy::no_retry(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn DocumentProcessingQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaLimiter>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_audit(mut self, audit: AuditRecorder) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn resolve_write(
        &self,
        workspace_id: &WorkspaceId,
        actor: &Actor,
        operation: AuditOperation,
    ) -> Result<Workspace, ServiceError> {
        let workspace = self
            .workspaces
            .get_workspace(workspace_id)
            .await
            .map_err(|e| e.to_service_error())?;

        match WorkspacePolicy::resolve_for_write(workspace.as_ref(), actor) {
            Ok(ws) => Ok(ws.clone()),
            Err(err) => {
                self.audit.record(
                    AuditEvent::new(operation, AuditOutcome::Denied)
                        .with_actor(actor.user_id.as_str())
                        .with_workspace(workspace_id.as_str()),
                );
                Err(err)
            }
        }
    }

    fn check_upload_quota(&self, workspace_id: &WorkspaceId) -> Result<(), ServiceError> {
        let Some(quota) = &self.quota else {
            return Ok(());
        };
        let scope = QuotaScope::Workspace(workspace_id.clone());
        let decision = quota.check(QuotaResource::Uploads, &scope);
        if !decision.allowed {
            return Err(ServiceError::unavailable(format!(
                "upload quota exceeded, retry after {}s",
                decision.retry_after_seconds
            )));
        }
        Ok(())
    }

    fn record_upload_quota(&self, workspace_id: &WorkspaceId) {
        if let Some(quota) = &self.quota {
            let scope = QuotaScope::Workspace(workspace_id.clone());
            quota.record(QuotaResource::Uploads, &scope, 1);
        }
    }

    /// Uploads a file and schedules processing. The blob is written before
    /// the row so the repository never points at a missing blob; a failed
    /// enqueue compensates by failing the row and deleting the orphan blob.
    pub async fn upload_document(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        title: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Document, ServiceError> {
        if title.trim().is_empty() || file_name.trim().is_empty() || mime_type.trim().is_empty() {
            return Err(ServiceError::validation(
                "title, file_name and mime_type are required",
            ));
        }
        if bytes.is_empty() {
            return Err(ServiceError::validation("file content must not be empty"));
        }

        self.resolve_write(workspace_id, actor, AuditOperation::DocumentUpload)
            .await?;
        self.check_upload_quota(workspace_id)?;

        let (Some(storage), Some(queue)) = (self.storage.as_ref(), self.queue.as_ref()) else {
            return Err(ServiceError::unavailable(
                "file storage or processing queue is not configured",
            ));
        };

        let document = Document::new(workspace_id.clone(), title, actor.user_id.clone())
            .with_file(file_name, mime_type);
        let storage_key = document
            .storage_key
            .clone()
            .expect("with_file sets the storage key");

        run_with_retry(self.retry, "storage_upload", || {
            storage.upload(&storage_key, bytes.clone(), Some(mime_type))
        })
        .await
        .map_err(|e| e.to_service_error())?;

        self.documents
            .save_document(document.clone())
            .await
            .map_err(|e| e.to_service_error())?;

        if let Err(enqueue_err) = queue.enqueue(&document.id, workspace_id).await {
            warn!(
                document_id = document.id.as_str(),
                "enqueue failed, compensating: {}", enqueue_err
            );
            let _ = self
                .documents
                .transition_status(
                    workspace_id,
                    &document.id,
                    &[DocumentStatus::Pending],
                    DocumentStatus::Failed,
                    Some("processing could not be scheduled".to_string()),
                )
                .await;
            if let Err(delete_err) = storage.delete(&storage_key).await {
                warn!("orphan blob cleanup failed: {}", delete_err);
            }
            self.audit.record(
                AuditEvent::new(AuditOperation::DocumentUpload, AuditOutcome::Failed)
                    .with_actor(actor.user_id.as_str())
                    .with_workspace(workspace_id.as_str())
                    .with_document(document.id.as_str()),
            );
            return Err(enqueue_err.to_service_error());
        }

        self.record_upload_quota(workspace_id);
        self.audit.record(
            AuditEvent::new(AuditOperation::DocumentUpload, AuditOutcome::Succeeded)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str())
                .with_document(document.id.as_str()),
        );
        Ok(document)
    }

    /// Ingests raw text synchronously: no blob, no queue, one atomic
    /// document-with-chunks write. Embedding is skipped when chunking yields
    /// nothing.
    pub async fn ingest_text(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        title: &str,
        text: &str,
    ) -> Result<Document, ServiceError> {
        if title.trim().is_empty() {
            return Err(ServiceError::validation("title is required"));
        }
        if text.trim().is_empty() {
            return Err(ServiceError::validation("text must not be empty"));
        }

        self.resolve_write(workspace_id, actor, AuditOperation::DocumentIngest)
            .await?;

        let mut document = Document::new(workspace_id.clone(), title, actor.user_id.clone());
        document.status = DocumentStatus::Ready;

        let mut chunks = chunk_document(&document.id, text, &self.chunking);
        for chunk in chunks.iter_mut() {
            chunk.metadata.insert(
                atalaya_core::model::DOCUMENT_TITLE_KEY.to_string(),
                document.title.clone(),
            );
            annotate_chunk(chunk);
        }

        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let embeddings = run_with_retry(self.retry, "embed_batch", || {
                self.embedder.embed_batch(&texts)
            })
            .await
            .map_err(|e| e.to_service_error())?;
            validate_batch_output(texts.len(), &embeddings, self.embedder.dimension())
                .map_err(|e| e.to_service_error())?;
            for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
                chunk.embedding = embedding;
            }
        }

        self.documents
            .save_document_with_chunks(document.clone(), chunks)
            .await
            .map_err(|e| e.to_service_error())?;

        self.audit.record(
            AuditEvent::new(AuditOperation::DocumentIngest, AuditOutcome::Succeeded)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str())
                .with_document(document.id.as_str()),
        );
        Ok(document)
    }

    /// Requeues a finished or failed document. Refused while a worker holds
    /// the PROCESSING claim.
    pub async fn reprocess(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::DocumentReprocess)
            .await?;

        let Some(document) = self
            .documents
            .get_document(workspace_id, document_id)
            .await
            .map_err(|e| e.to_service_error())?
        else {
            return Err(ServiceError::missing("document not found"));
        };

        if document.status == DocumentStatus::Processing {
            return Err(ServiceError::conflict(
                "document is currently being processed",
            ));
        }

        let Some(queue) = self.queue.as_ref() else {
            return Err(ServiceError::unavailable("processing queue is not configured"));
        };

        self.documents
            .transition_status(
                workspace_id,
                document_id,
                &[
                    DocumentStatus::Pending,
                    DocumentStatus::Ready,
                    DocumentStatus::Failed,
                ],
                DocumentStatus::Pending,
                None,
            )
            .await
            .map_err(|e| e.to_service_error())?;

        if let Err(enqueue_err) = queue.enqueue(document_id, workspace_id).await {
            let _ = self
                .documents
                .transition_status(
                    workspace_id,
                    document_id,
                    &[DocumentStatus::Pending],
                    DocumentStatus::Failed,
                    Some("reprocess could not be scheduled".to_string()),
                )
                .await;
            return Err(enqueue_err.to_service_error());
        }

        self.audit.record(
            AuditEvent::new(AuditOperation::DocumentReprocess, AuditOutcome::Succeeded)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str())
                .with_document(document_id.as_str()),
        );
        Ok(())
    }

    /// Frees a zombie claim left by a dead worker. Only PROCESSING documents
    /// can be cancelled.
    pub async fn cancel(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        reason: &str,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::DocumentCancel)
            .await?;

        let outcome = self
            .documents
            .transition_status(
                workspace_id,
                document_id,
                &[DocumentStatus::Processing],
                DocumentStatus::Failed,
                Some(reason.to_string()),
            )
            .await
            .map_err(|e| e.to_service_error())?;

        match outcome {
            storage::document_repo::TransitionOutcome::Applied => {
                self.audit.record(
                    AuditEvent::new(AuditOperation::DocumentCancel, AuditOutcome::Succeeded)
                        .with_actor(actor.user_id.as_str())
                        .with_workspace(workspace_id.as_str())
                        .with_document(document_id.as_str())
                        .with_metadata("reason", reason),
                );
                Ok(())
            }
            storage::document_repo::TransitionOutcome::Observed(status) => Err(
                ServiceError::conflict(format!("document is {}, not PROCESSING", status)),
            ),
        }
    }

    /// Soft-deletes the row, drops its chunks and best-effort deletes the
    /// blob.
    pub async fn delete_document(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::DocumentDelete)
            .await?;

        let Some(document) = self
            .documents
            .get_document(workspace_id, document_id)
            .await
            .map_err(|e| e.to_service_error())?
        else {
            return Err(ServiceError::missing("document not found"));
        };

        self.documents
            .delete_document(workspace_id, document_id)
            .await
            .map_err(|e| e.to_service_error())?;
        self.documents
            .delete_chunks(document_id)
            .await
            .map_err(|e| e.to_service_error())?;

        if let (Some(storage), Some(key)) = (self.storage.as_ref(), document.storage_key.as_deref())
        {
            if let Err(err) = storage.delete(key).await {
                warn!("blob delete failed for {}: {}", key, err);
            }
        }

        self.audit.record(
            AuditEvent::new(AuditOperation::DocumentDelete, AuditOutcome::Succeeded)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str())
                .with_document(document_id.as_str()),
        );
        Ok(())
    }
}
