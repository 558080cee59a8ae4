use crate::queue::ProcessingJob;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: ProcessingJob) -> anyhow::Result<()>;
}

/// A pool of concurrent job executors sharing one receiver. Handler failures
/// are logged and never take a worker down; the document state machine is
/// what records them.
pub struct WorkerPool {
    receiver: Arc<Mutex<mpsc::Receiver<ProcessingJob>>>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(receiver: mpsc::Receiver<ProcessingJob>, concurrency: usize) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self, handler: Arc<dyn JobHandler>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker_id| {
                let receiver = self.receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        let job = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { break };

                        let document_id = job.document_id.clone();
                        if let Err(e) = handler.handle(job).await {
                            error!(worker_id, document_id = document_id.as_str(), "job failed: {}", e);
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect()
    }
}
