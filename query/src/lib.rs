pub mod answer;
pub mod context;
pub mod filter;
pub mod rerank;
pub mod rewrite;
pub mod search;

pub use answer::{AnswerRequest, AnswerResponse, AnswerService, AnswerStream, StreamEvent};
pub use context::{BuiltContext, ContextBuilder, SourceRef};
pub use filter::InjectionFilter;
pub use rerank::Reranker;
pub use rewrite::{HistoryTurn, QueryRewriter};
pub use search::{RetrievalResult, Retriever};
