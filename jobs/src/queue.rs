use async_trait::async_trait;
use atalaya_core::error::{CodedError, ErrorCode};
use atalaya_core::model::{DocumentId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// A document processing job. Arguments stay string-serializable so any
/// queue backend can carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub document_id: String,
    pub workspace_id: String,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no worker attached to queue {0}")]
    NoWorker(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl CodedError for QueueError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ServiceUnavailable
    }
}

#[async_trait]
pub trait DocumentProcessingQueue: Send + Sync {
    /// Accepts a job and returns its id. Fails fast when the job target is
    /// not resolvable (no consumer attached) instead of accepting work that
    /// can never run.
    async fn enqueue(
        &self,
        document_id: &DocumentId,
        workspace_id: &WorkspaceId,
    ) -> Result<String, QueueError>;
}

/// In-process queue over a Tokio channel.
pub struct ChannelQueue {
    queue_name: String,
    sender: mpsc::Sender<ProcessingJob>,
    job_counter: AtomicU64,
}

impl ChannelQueue {
    pub fn channel(
        queue_name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ProcessingJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                queue_name: queue_name.into(),
                sender,
                job_counter: AtomicU64::new(0),
            },
            receiver,
        )
    }
}

#[async_trait]
impl DocumentProcessingQueue for ChannelQueue {
    async fn enqueue(
        &self,
        document_id: &DocumentId,
        workspace_id: &WorkspaceId,
    ) -> Result<String, QueueError> {
        if self.sender.is_closed() {
            return Err(QueueError::NoWorker(self.queue_name.clone()));
        }

        let job = ProcessingJob {
            document_id: document_id.as_str().to_string(),
            workspace_id: workspace_id.as_str().to_string(),
        };
        self.sender
            .send(job)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let n = self.job_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}:{}", self.queue_name, n))
    }
}
