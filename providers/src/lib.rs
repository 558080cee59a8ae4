pub mod cache;
pub mod embedding;
pub mod llm;
pub mod prompt;
pub mod retry;

pub use cache::CachedEmbeddingService;
pub use embedding::{EmbeddingError, EmbeddingService, FakeEmbedder};
pub use llm::{FakeLlm, LLMError, LLMService};
pub use prompt::{PromptAssembler, PromptError, PromptTemplate};
pub use retry::{run_with_retry, RetryClass, RetryPolicy, Retryable};
