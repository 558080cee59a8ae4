//! Composition root: builds every port once from `AppConfig` and hands the
//! use cases out as shared singletons. No ambient globals; the binary owns
//! the context and tears it down.

use atalaya_core::audit::{AuditRecorder, AuditSink};
use atalaya_core::config::{AppConfig, RerankMode};
use atalaya_core::error::ServiceError;
use atalaya_core::quota::{InMemoryQuotaLimiter, QuotaLimiter};
use ingestion::chunker::ChunkingConfig;
use ingestion::processor::{DocumentProcessor, ProcessorHandler};
use ingestion::upload::IngestionService;
use ingestion::workspace::WorkspaceAdminService;
use jobs::queue::{ChannelQueue, DocumentProcessingQueue};
use jobs::worker::WorkerPool;
use providers::cache::CachedEmbeddingService;
use providers::embedding::{EmbeddingService, FakeEmbedder};
use providers::llm::{FakeLlm, LLMService};
use providers::prompt::PromptAssembler;
use providers::retry::RetryPolicy;
use query::answer::AnswerService;
use query::context::ContextBuilder;
use query::filter::InjectionFilter;
use query::rerank::Reranker;
use query::rewrite::QueryRewriter;
use query::search::Retriever;
use std::sync::Arc;
use storage::embedding_cache::InMemoryEmbeddingCache;
use storage::file_storage::{FileStorage, InMemoryFileStorage, LocalFileStorage};
use storage::memory::InMemoryStore;
use tokio::task::JoinHandle;

const QUEUE_CAPACITY: usize = 128;

pub struct AppContextBuilder {
    config: AppConfig,
    embedding_override: Option<Arc<dyn EmbeddingService>>,
    llm_override: Option<Arc<dyn LLMService>>,
    storage_override: Option<Arc<dyn FileStorage>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl AppContextBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            embedding_override: None,
            llm_override: None,
            storage_override: None,
            audit_sink: None,
        }
    }

    /// Injects a real embedding provider; without one, `embedding.fake`
    /// must be set.
    pub fn with_embedding_service(mut self, service: Arc<dyn EmbeddingService>) -> Self {
        self.embedding_override = Some(service);
        self
    }

    pub fn with_llm_service(mut self, service: Arc<dyn LLMService>) -> Self {
        self.llm_override = Some(service);
        self
    }

    pub fn with_file_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage_override = Some(storage);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<AppContext, ServiceError> {
        let config = self.config;

        let embedder_base: Arc<dyn EmbeddingService> = match self.embedding_override {
            Some(service) => service,
            None if config.embedding.fake => Arc::new(FakeEmbedder::new(
                config.embedding.model_id.clone(),
                config.embedding.dimension,
            )),
            None => {
                return Err(ServiceError::unavailable(
                    "no embedding provider configured and embedding.fake is off",
                ))
            }
        };
        let embedder: Arc<dyn EmbeddingService> = Arc::new(CachedEmbeddingService::new(
            embedder_base,
            Arc::new(InMemoryEmbeddingCache::new()),
        ));

        let llm: Arc<dyn LLMService> = match self.llm_override {
            Some(service) => service,
            None if config.llm.fake => Arc::new(FakeLlm::new()),
            None => {
                return Err(ServiceError::unavailable(
                    "no llm provider configured and llm.fake is off",
                ))
            }
        };

        let file_storage: Arc<dyn FileStorage> = match self.storage_override {
            Some(storage) => storage,
            None => match &config.storage.root_dir {
                Some(root) => Arc::new(LocalFileStorage::new(root)),
                None => Arc::new(InMemoryFileStorage::new()),
            },
        };

        let store = Arc::new(InMemoryStore::new());
        let quota: Arc<dyn QuotaLimiter> = Arc::new(InMemoryQuotaLimiter::new(&config.quota));
        let audit = match self.audit_sink {
            Some(sink) => AuditRecorder::new(sink),
            None => AuditRecorder::disabled(),
        };
        let retry = RetryPolicy::from_config(&config.retry);
        let prompts = Arc::new(PromptAssembler::new(
            &config.llm.prompts_dir,
            config.llm.prompt_language.clone(),
        ));

        let (queue, queue_rx) = ChannelQueue::channel(config.queue.queue_name.clone(), QUEUE_CAPACITY);
        let queue: Arc<dyn DocumentProcessingQueue> = Arc::new(queue);

        let processor = Arc::new(DocumentProcessor::new(
            store.clone(),
            Some(file_storage.clone()),
            embedder.clone(),
            ChunkingConfig::default(),
            retry,
        ));
        let worker_handles = WorkerPool::new(queue_rx, config.queue.worker_concurrency)
            .spawn(Arc::new(ProcessorHandler::new(processor.clone())));

        let workspaces = Arc::new(
            WorkspaceAdminService::new(store.clone()).with_audit(audit.clone()),
        );

        let ingestion = Arc::new(
            IngestionService::new(store.clone(), store.clone(), embedder.clone())
                .with_storage(file_storage.clone())
                .with_queue(queue.clone())
                .with_quota(quota.clone())
                .with_audit(audit.clone())
                .with_retry(retry),
        );

        let retriever = Arc::new(
            Retriever::new(store.clone(), embedder.clone())
                .with_hybrid(
                    config.retrieval.enable_hybrid_search,
                    config.retrieval.rrf_k,
                )
                .with_retry(retry),
        );

        let rerank_mode = if config.retrieval.enable_reranker {
            config.retrieval.rerank_mode
        } else {
            RerankMode::Disabled
        };
        let mut reranker = Reranker::new(rerank_mode, config.retrieval.rerank_top_k);
        if rerank_mode == RerankMode::Llm {
            reranker = reranker.with_llm(llm.clone());
        }

        let mut answers = AnswerService::new(
            store.clone(),
            retriever,
            llm.clone(),
            prompts.clone(),
            config.llm.prompt_version.clone(),
            config.retrieval.max_context_chars,
        )
        .with_filter(InjectionFilter::new(
            config.retrieval.injection_filter_mode,
            config.retrieval.injection_filter_threshold,
        ))
        .with_reranker(Arc::new(reranker))
        .with_context_builder(Arc::new(ContextBuilder::new(
            config.retrieval.max_context_chars,
        )))
        .with_quota(quota.clone())
        .with_audit(audit.clone())
        .with_retry(retry)
        .with_top_k(config.retrieval.top_k);

        if config.retrieval.enable_rewriter {
            answers = answers.with_rewriter(Arc::new(QueryRewriter::new(
                llm.clone(),
                prompts.clone(),
                config.llm.prompt_version.clone(),
            )));
        }

        Ok(AppContext {
            config,
            store,
            file_storage,
            embedder,
            llm,
            quota,
            audit,
            queue,
            processor,
            workspaces,
            ingestion,
            answers: Arc::new(answers),
            worker_handles,
        })
    }
}

/// Everything a transport needs, built once at process start.
pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<InMemoryStore>,
    pub file_storage: Arc<dyn FileStorage>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub llm: Arc<dyn LLMService>,
    pub quota: Arc<dyn QuotaLimiter>,
    pub audit: AuditRecorder,
    pub queue: Arc<dyn DocumentProcessingQueue>,
    pub processor: Arc<DocumentProcessor>,
    pub workspaces: Arc<WorkspaceAdminService>,
    pub ingestion: Arc<IngestionService>,
    pub answers: Arc<AnswerService>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn builder(config: AppConfig) -> AppContextBuilder {
        AppContextBuilder::new(config)
    }

    /// Stops the worker pool. Queued jobs are dropped; the state machine
    /// leaves their documents in PENDING for a later reprocess.
    pub fn shutdown(self) {
        for handle in self.worker_handles {
            handle.abort();
        }
    }
}
