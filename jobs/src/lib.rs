pub mod queue;
pub mod worker;

pub use queue::{ChannelQueue, DocumentProcessingQueue, ProcessingJob, QueueError};
pub use worker::{JobHandler, WorkerPool};
