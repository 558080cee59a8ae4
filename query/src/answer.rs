use crate::context::{BuiltContext, ContextBuilder, SourceRef};
use crate::filter::InjectionFilter;
use crate::rerank::Reranker;
use crate::rewrite::{HistoryTurn, QueryRewriter};
use crate::search::Retriever;
use atalaya_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditRecorder};
use atalaya_core::auth::{Actor, WorkspacePolicy};
use atalaya_core::error::{CodedError, ErrorCode, ServiceError};
use atalaya_core::model::{generate_conversation_id, WorkspaceId};
use atalaya_core::quota::{QuotaLimiter, QuotaResource, QuotaScope};
use providers::llm::LLMService;
use providers::prompt::PromptAssembler;
use providers::retry::{run_with_retry, RetryPolicy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::workspace_repo::WorkspaceRepository;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Returned instead of calling the LLM when retrieval produced nothing.
pub const EMPTY_CONTEXT_FALLBACK: &str =
    "No he encontrado información relevante en los documentos de este espacio de trabajo.";

const ANSWER_CAPABILITY: &str = "rag_answer";

/// Wire events of an answer stream, in strict order:
/// `sources → token* → (done | error)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Sources {
        sources: Vec<SourceRef>,
        conversation_id: String,
    },
    Token {
        text: String,
    },
    Done {
        answer: String,
        conversation_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Producer-side bounds. Streams that outgrow them end with an `overflow`
/// error event.
#[derive(Debug, Clone, Copy)]
pub struct StreamCaps {
    pub max_events: usize,
    pub max_chars: usize,
    pub timeout: Duration,
}

impl Default for StreamCaps {
    fn default() -> Self {
        Self {
            max_events: 2000,
            max_chars: 12_000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub workspace_id: WorkspaceId,
    pub query: String,
    pub conversation_id: Option<String>,
    pub history: Vec<HistoryTurn>,
}

impl AnswerRequest {
    pub fn new(workspace_id: WorkspaceId, query: impl Into<String>) -> Self {
        Self {
            workspace_id,
            query: query.into(),
            conversation_id: None,
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnswerResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub conversation_id: String,
    pub hybrid_used: bool,
}

/// A cancellable, bounded stream of answer events. Dropping it or calling
/// `cancel` stops the producer and propagates to the LLM call; once the
/// first byte is out nothing is retried.
pub struct AnswerStream {
    receiver: mpsc::Receiver<StreamEvent>,
    handle: JoinHandle<()>,
}

impl AnswerStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        let mut this = std::mem::ManuallyDrop::new(self);
        let receiver = unsafe { std::ptr::read(&this.receiver) };
        unsafe { std::ptr::drop_in_place(&mut this.handle) };
        ReceiverStream::new(receiver)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Prepared {
    context: BuiltContext,
    effective_query: String,
    conversation_id: String,
    hybrid_used: bool,
}

/// Read-side orchestration: rewrite → retrieve → filter → rerank → assemble
/// → generate, in both single-shot and streaming shapes.
pub struct AnswerService {
    workspaces: Arc<dyn WorkspaceRepository>,
    retriever: Arc<Retriever>,
    filter: InjectionFilter,
    reranker: Arc<Reranker>,
    context_builder: Arc<ContextBuilder>,
    llm: Arc<dyn LLMService>,
    prompts: Arc<PromptAssembler>,
    prompt_version: String,
    rewriter: Option<Arc<QueryRewriter>>,
    quota: Option<Arc<dyn QuotaLimiter>>,
    audit: AuditRecorder,
    retry: RetryPolicy,
    top_k: usize,
    caps: StreamCaps,
}

impl AnswerService {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        retriever: Arc<Retriever>,
        llm: Arc<dyn LLMService>,
        prompts: Arc<PromptAssembler>,
        prompt_version: impl Into<String>,
        max_context_chars: usize,
    ) -> Self {
        Self {
            workspaces,
            retriever,
            filter: InjectionFilter::off(),
            reranker: Arc::new(Reranker::disabled()),
            context_builder: Arc::new(ContextBuilder::new(max_context_chars)),
            llm,
            prompts,
            prompt_version: prompt_version.into(),
            rewriter: None,
            quota: None,
            audit: AuditRecorder::disabled(),
            retry: RetryPolicy::no_retry(),
            top_k: 8,
            caps: StreamCaps::default(),
        }
    }

    pub fn with_filter(mut self, filter: InjectionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_context_builder(mut self, builder: Arc<ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaLimiter>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_audit(mut self, audit: AuditRecorder) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_caps(mut self, caps: StreamCaps) -> Self {
        self.caps = caps;
        self
    }

    async fn prepare(&self, actor: &Actor, request: &AnswerRequest) -> Result<Prepared, ServiceError> {
        if request.query.trim().is_empty() {
            return Err(ServiceError::validation("query must not be empty"));
        }

        let workspace = self
            .workspaces
            .get_workspace(&request.workspace_id)
            .await
            .map_err(|e| e.to_service_error())?;
        if let Err(err) = WorkspacePolicy::resolve_for_read(workspace.as_ref(), actor) {
            self.audit.record(
                AuditEvent::new(AuditOperation::Query, AuditOutcome::Denied)
                    .with_actor(actor.user_id.as_str())
                    .with_workspace(request.workspace_id.as_str()),
            );
            return Err(err);
        }

        if let Some(quota) = &self.quota {
            let scope = QuotaScope::Workspace(request.workspace_id.clone());
            let decision = quota.check(QuotaResource::Messages, &scope);
            if !decision.allowed {
                return Err(ServiceError::unavailable(format!(
                    "message quota exceeded, retry after {}s",
                    decision.retry_after_seconds
                )));
            }
            quota.record(QuotaResource::Messages, &scope, 1);
        }

        let effective_query = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(&request.query, &request.history).await,
            None => request.query.clone(),
        };

        let retrieval = self
            .retriever
            .retrieve(&request.workspace_id, &effective_query, self.top_k)
            .await?;
        let hybrid_used = retrieval.hybrid_used;

        let filtered = self.filter.apply(retrieval.chunks);
        let reranked = self.reranker.rerank(&effective_query, filtered).await;
        let context = self.context_builder.build(&reranked);

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(generate_conversation_id);

        info!(
            workspace_id = request.workspace_id.as_str(),
            hybrid_used,
            chunks_used = context.chunks_used.len(),
            "context assembled"
        );

        Ok(Prepared {
            context,
            effective_query,
            conversation_id,
            hybrid_used,
        })
    }

    fn format_prompt(&self, context: &str, query: &str) -> Result<String, ServiceError> {
        let prompt = self
            .prompts
            .load(&self.prompt_version, ANSWER_CAPABILITY)
            .map_err(|e| ServiceError::unavailable(e.to_string()))?;
        let kwargs: HashMap<String, String> = HashMap::from([
            ("context".to_string(), context.to_string()),
            ("query".to_string(), query.to_string()),
        ]);
        prompt
            .format(&kwargs)
            .map_err(|e| ServiceError::unavailable(e.to_string()))
    }

    fn record_query_audit(&self, actor: &Actor, workspace_id: &WorkspaceId, outcome: AuditOutcome) {
        self.audit.record(
            AuditEvent::new(AuditOperation::Query, outcome)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str()),
        );
    }

    /// Single-shot answering. The empty-context fallback never reaches the
    /// LLM; generation start is retried per policy.
    pub async fn ask(
        &self,
        actor: &Actor,
        request: &AnswerRequest,
    ) -> Result<AnswerResponse, ServiceError> {
        let prepared = self.prepare(actor, request).await?;

        if prepared.context.is_empty() {
            self.record_query_audit(actor, &request.workspace_id, AuditOutcome::Succeeded);
            return Ok(AnswerResponse {
                answer: EMPTY_CONTEXT_FALLBACK.to_string(),
                sources: Vec::new(),
                conversation_id: prepared.conversation_id,
                hybrid_used: prepared.hybrid_used,
            });
        }

        let prompt = self.format_prompt(&prepared.context.text, &prepared.effective_query)?;
        let answer = run_with_retry(self.retry, "generate_answer", || {
            self.llm.generate_answer(&prepared.effective_query, &prompt)
        })
        .await
        .map_err(|e| {
            self.record_query_audit(actor, &request.workspace_id, AuditOutcome::Failed);
            e.to_service_error()
        })?;

        self.record_query_audit(actor, &request.workspace_id, AuditOutcome::Succeeded);
        Ok(AnswerResponse {
            answer,
            sources: prepared.context.sources,
            conversation_id: prepared.conversation_id,
            hybrid_used: prepared.hybrid_used,
        })
    }

    /// Streaming answering. Events keep the `sources → token* → done|error`
    /// order; the producer suspends on every send, so consumer backpressure
    /// and cancellation reach the LLM call.
    pub async fn ask_stream(
        &self,
        actor: &Actor,
        request: &AnswerRequest,
    ) -> Result<AnswerStream, ServiceError> {
        let prepared = self.prepare(actor, request).await?;
        let (tx, rx) = mpsc::channel::<StreamEvent>(1);

        if prepared.context.is_empty() {
            let conversation_id = prepared.conversation_id;
            let handle = tokio::spawn(async move {
                let _ = tx
                    .send(StreamEvent::Sources {
                        sources: Vec::new(),
                        conversation_id: conversation_id.clone(),
                    })
                    .await;
                let _ = tx
                    .send(StreamEvent::Token {
                        text: EMPTY_CONTEXT_FALLBACK.to_string(),
                    })
                    .await;
                let _ = tx
                    .send(StreamEvent::Done {
                        answer: EMPTY_CONTEXT_FALLBACK.to_string(),
                        conversation_id,
                    })
                    .await;
            });
            return Ok(AnswerStream {
                receiver: rx,
                handle,
            });
        }

        let prompt = self.format_prompt(&prepared.context.text, &prepared.effective_query)?;
        let llm = self.llm.clone();
        let retry = self.retry;
        let caps = self.caps;
        let audit = self.audit.clone();
        let actor_id = actor.user_id.as_str().to_string();
        let workspace_id = request.workspace_id.as_str().to_string();
        let effective_query = prepared.effective_query;
        let sources = prepared.context.sources;
        let conversation_id = prepared.conversation_id;

        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + caps.timeout;

            if tx
                .send(StreamEvent::Sources {
                    sources,
                    conversation_id: conversation_id.clone(),
                })
                .await
                .is_err()
            {
                return;
            }

            // Starting generation is retryable; emitted fragments are not.
            let mut fragments =
                match run_with_retry(retry, "generate_stream", || {
                    llm.generate_stream(&effective_query, &prompt)
                })
                .await
                {
                    Ok(fragments) => fragments,
                    Err(err) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                code: ErrorCode::LlmError.to_string(),
                                message: err.to_string(),
                            })
                            .await;
                        return;
                    }
                };

            let mut answer = String::new();
            let mut events = 1usize;
            let mut chars = 0usize;

            loop {
                let fragment = match timeout_at(deadline, fragments.recv()).await {
                    Ok(fragment) => fragment,
                    Err(_) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                code: "timeout".to_string(),
                                message: "answer stream exceeded its time budget".to_string(),
                            })
                            .await;
                        return;
                    }
                };

                match fragment {
                    Some(Ok(text)) => {
                        events += 1;
                        chars += text.chars().count();
                        if events > caps.max_events || chars > caps.max_chars {
                            warn!(events, chars, "answer stream overflow");
                            let _ = tx
                                .send(StreamEvent::Error {
                                    code: "overflow".to_string(),
                                    message: "answer stream exceeded its size budget".to_string(),
                                })
                                .await;
                            return;
                        }

                        answer.push_str(&text);
                        if tx.send(StreamEvent::Token { text }).await.is_err() {
                            // Consumer cancelled; dropping `fragments` stops
                            // the LLM. No retry once bytes are out.
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                code: ErrorCode::LlmError.to_string(),
                                message: err.to_string(),
                            })
                            .await;
                        return;
                    }
                    None => {
                        audit.record(
                            AuditEvent::new(AuditOperation::Query, AuditOutcome::Succeeded)
                                .with_actor(actor_id.as_str())
                                .with_workspace(workspace_id.as_str()),
                        );
                        let _ = tx
                            .send(StreamEvent::Done {
                                answer,
                                conversation_id,
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(AnswerStream {
            receiver: rx,
            handle,
        })
    }
}
