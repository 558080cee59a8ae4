pub mod document_repo;
pub mod embedding_cache;
pub mod file_storage;
pub mod memory;
pub mod workspace_repo;

pub use document_repo::{
    DocumentFilter, DocumentPage, DocumentRepository, RepoError, TransitionOutcome,
};
pub use embedding_cache::{CacheError, EmbeddingCache, InMemoryEmbeddingCache};
pub use file_storage::{FileStorage, InMemoryFileStorage, LocalFileStorage, StorageError};
pub use memory::InMemoryStore;
pub use workspace_repo::WorkspaceRepository;
