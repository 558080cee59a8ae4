use crate::chunker::{chunk_document, ChunkingConfig};
use crate::extract::{extract_text, ExtractError};
use crate::injection::annotate_chunk;
use async_trait::async_trait;
use atalaya_core::model::{Document, DocumentId, DocumentStatus, WorkspaceId};
use jobs::queue::ProcessingJob;
use jobs::worker::JobHandler;
use providers::embedding::{validate_batch_output, EmbeddingError, EmbeddingService};
use providers::retry::{run_with_retry, RetryPolicy};
use std::sync::Arc;
use storage::document_repo::{DocumentRepository, RepoError, TransitionOutcome};
use storage::file_storage::{FileStorage, StorageError};
use thiserror::Error;
use tracing::{info, warn};

const ERROR_MESSAGE_LIMIT: usize = 512;
const MISSING_METADATA_MESSAGE: &str = "Missing file metadata for processing";

/// Result of one worker-job delivery. Redeliveries are harmless: a document
/// already claimed or finished reports what was observed and does no work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ready { chunk_count: usize },
    Failed { message: String },
    Missing,
    Observed(DocumentStatus),
}

#[derive(Error, Debug)]
enum PipelineError {
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("{0}")]
    Embedding(#[from] EmbeddingError),
    #[error("{0}")]
    Repo(#[from] RepoError),
}

pub struct DocumentProcessor {
    documents: Arc<dyn DocumentRepository>,
    storage: Option<Arc<dyn FileStorage>>,
    embedder: Arc<dyn EmbeddingService>,
    chunking: ChunkingConfig,
    retry: RetryPolicy,
}

impl DocumentProcessor {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        storage: Option<Arc<dyn FileStorage>>,
        embedder: Arc<dyn EmbeddingService>,
        chunking: ChunkingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            documents,
            storage,
            embedder,
            chunking,
            retry,
        }
    }

    /// Drives one document through PENDING → PROCESSING → READY | FAILED.
    /// Pipeline faults are recorded on the document row; only repository
    /// infrastructure faults surface as errors.
    pub async fn process(
        &self,
        document_id: &DocumentId,
        workspace_id: &WorkspaceId,
    ) -> Result<ProcessOutcome, RepoError> {
        let Some(document) = self.documents.get_document(workspace_id, document_id).await? else {
            return Ok(ProcessOutcome::Missing);
        };

        if matches!(
            document.status,
            DocumentStatus::Ready | DocumentStatus::Processing
        ) {
            return Ok(ProcessOutcome::Observed(document.status));
        }

        // Claim: losers of the race observe the winner's status and stop.
        let claim = self
            .documents
            .transition_status(
                workspace_id,
                document_id,
                &[DocumentStatus::Pending, DocumentStatus::Failed],
                DocumentStatus::Processing,
                None,
            )
            .await?;
        if let TransitionOutcome::Observed(status) = claim {
            return Ok(ProcessOutcome::Observed(status));
        }

        if self.storage.is_none() || !document.has_file_metadata() {
            self.mark_failed(workspace_id, document_id, MISSING_METADATA_MESSAGE)
                .await?;
            return Ok(ProcessOutcome::Failed {
                message: MISSING_METADATA_MESSAGE.to_string(),
            });
        }

        match self.run_pipeline(&document).await {
            Ok(chunk_count) => {
                self.documents
                    .transition_status(
                        workspace_id,
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Ready,
                        None,
                    )
                    .await?;
                info!(
                    document_id = document_id.as_str(),
                    chunk_count, "document processed"
                );
                Ok(ProcessOutcome::Ready { chunk_count })
            }
            Err(err) => {
                let message = truncate_error(&err.to_string());
                warn!(
                    document_id = document_id.as_str(),
                    "document processing failed: {}", message
                );
                self.mark_failed(workspace_id, document_id, &message).await?;
                Ok(ProcessOutcome::Failed { message })
            }
        }
    }

    async fn run_pipeline(&self, document: &Document) -> Result<usize, PipelineError> {
        let storage = self.storage.as_ref().expect("storage checked by caller");
        let storage_key = document.storage_key.as_deref().expect("metadata checked");
        let mime_type = document.mime_type.as_deref().expect("metadata checked");

        let bytes = run_with_retry(self.retry, "storage_download", || {
            storage.download(storage_key)
        })
        .await?;

        let text = extract_text(&bytes, mime_type, document.file_name.as_deref())?;
        let mut chunks = chunk_document(&document.id, &text, &self.chunking);

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
            .await?;
            validate_batch_output(texts.len(), &embeddings, self.embedder.dimension())?;
            for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
                chunk.embedding = embedding;
            }
        }

        let chunk_count = chunks.len();
        self.documents.delete_chunks(&document.id).await?;
        self.documents.save_chunks(&document.id, chunks).await?;
        Ok(chunk_count)
    }

    async fn mark_failed(
        &self,
        workspace_id: &WorkspaceId,
        document_id: &DocumentId,
        message: &str,
    ) -> Result<(), RepoError> {
        self.documents
            .transition_status(
                workspace_id,
                document_id,
                &[DocumentStatus::Processing],
                DocumentStatus::Failed,
                Some(message.to_string()),
            )
            .await?;
        Ok(())
    }
}

fn truncate_error(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

/// Adapts the processor to the worker pool's job contract.
pub struct ProcessorHandler {
    processor: Arc<DocumentProcessor>,
}

impl ProcessorHandler {
    pub fn new(processor: Arc<DocumentProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for ProcessorHandler {
    async fn handle(&self, job: ProcessingJob) -> anyhow::Result<()> {
        let document_id = DocumentId::from(job.document_id.as_str());
        let workspace_id = WorkspaceId::from(job.workspace_id.as_str());
        let outcome = self.processor.process(&document_id, &workspace_id).await?;
        info!(
            document_id = document_id.as_str(),
            outcome = ?outcome,
            "processing job finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_error_messages_on_char_boundaries() {
        let long = "ñ".repeat(600);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), 512);
    }
}
