pub mod chunker;
pub mod extract;
pub mod injection;
pub mod processor;
pub mod upload;
pub mod workspace;

pub use chunker::{chunk_text, ChunkingConfig};
pub use processor::{DocumentProcessor, ProcessOutcome, ProcessorHandler};
pub use upload::IngestionService;
pub use workspace::WorkspaceAdminService;
