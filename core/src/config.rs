use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    #[default]
    Disabled,
    Heuristic,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectionFilterMode {
    Off,
    Exclude,
    #[default]
    Downrank,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model_id")]
    pub model_id: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Selects the deterministic fake provider instead of a remote one.
    #[serde(default = "default_true")]
    pub fake: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: default_embedding_model_id(),
            dimension: default_embedding_dimension(),
            fake: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub fake: bool,
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    #[serde(default = "default_prompt_language")]
    pub prompt_language: String,
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            fake: true,
            prompt_version: default_prompt_version(),
            prompt_language: default_prompt_language(),
            prompts_dir: default_prompts_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enable_hybrid_search: bool,
    #[serde(default)]
    pub enable_rewriter: bool,
    #[serde(default)]
    pub enable_reranker: bool,
    #[serde(default)]
    pub rerank_mode: RerankMode,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default)]
    pub injection_filter_mode: InjectionFilterMode,
    #[serde(default = "default_injection_threshold")]
    pub injection_filter_threshold: f32,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enable_hybrid_search: false,
            enable_rewriter: false,
            enable_reranker: false,
            rerank_mode: RerankMode::Disabled,
            rerank_top_k: default_rerank_top_k(),
            injection_filter_mode: InjectionFilterMode::Downrank,
            injection_filter_threshold: default_injection_threshold(),
            max_context_chars: default_max_context_chars(),
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_messages_per_hour")]
    pub messages_per_hour: u64,
    #[serde(default = "default_tokens_per_hour")]
    pub tokens_per_hour: u64,
    #[serde(default = "default_uploads_per_hour")]
    pub uploads_per_hour: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            messages_per_hour: default_messages_per_hour(),
            tokens_per_hour: default_tokens_per_hour(),
            uploads_per_hour: default_uploads_per_hour(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_seconds: default_retry_base_delay(),
            max_delay_seconds: default_retry_max_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BlobStorageConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root directory for the local filesystem backend.
    #[serde(default)]
    pub root_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            queue_name: default_queue_name(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: BlobStorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("ATALAYA").separator("__"));

        builder.build()?.try_deserialize()
    }
}

fn default_true() -> bool {
    true
}

fn default_embedding_model_id() -> String {
    "text-embedding-004".to_string()
}

fn default_embedding_dimension() -> usize {
    crate::model::DEFAULT_EMBEDDING_DIMENSION
}

fn default_prompt_version() -> String {
    "v1".to_string()
}

fn default_prompt_language() -> String {
    "es".to_string()
}

fn default_prompts_dir() -> String {
    "prompts".to_string()
}

fn default_rerank_top_k() -> usize {
    5
}

fn default_injection_threshold() -> f32 {
    0.6
}

fn default_max_context_chars() -> usize {
    6000
}

fn default_top_k() -> usize {
    8
}

fn default_rrf_k() -> f32 {
    60.0
}

fn default_messages_per_hour() -> u64 {
    60
}

fn default_tokens_per_hour() -> u64 {
    100_000
}

fn default_uploads_per_hour() -> u64 {
    20
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    0.5
}

fn default_retry_max_delay() -> f64 {
    8.0
}

fn default_queue_name() -> String {
    "document-processing".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}
