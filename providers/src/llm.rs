use async_trait::async_trait;
use atalaya_core::error::{CodedError, ErrorCode};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum LLMError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("llm provider error: {message}")]
    Provider {
        status: Option<u16>,
        message: String,
    },
    #[error("generation cancelled")]
    Cancelled,
}

impl LLMError {
    pub fn status(&self) -> Option<u16> {
        match self {
            LLMError::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

impl CodedError for LLMError {
    fn error_code(&self) -> ErrorCode {
        match self {
            LLMError::EmptyPrompt => ErrorCode::Validation,
            _ => ErrorCode::LlmError,
        }
    }
}

/// Fragments produced by `generate_stream`; concatenating the `Ok` payloads
/// yields the full answer.
pub type FragmentReceiver = mpsc::Receiver<Result<String, LLMError>>;

#[async_trait]
pub trait LLMService: Send + Sync {
    async fn generate_answer(&self, query: &str, context: &str) -> Result<String, LLMError>;

    async fn generate_text(&self, prompt: &str, max_tokens: u32) -> Result<String, LLMError>;

    /// Begins generation and returns a lazy fragment sequence. Dropping the
    /// receiver cancels the underlying generation.
    async fn generate_stream(
        &self,
        query: &str,
        context: &str,
    ) -> Result<FragmentReceiver, LLMError>;
}

/// Deterministic stand-in used when `llm.fake` is set. Answers quote the
/// context's source list so citation plumbing stays observable end to end.
pub struct FakeLlm;

impl FakeLlm {
    pub fn new() -> Self {
        Self
    }

    fn compose(query: &str, context: &str) -> String {
        let sources = context
            .split_once("FUENTES:")
            .map(|(_, tail)| format!("\n\nFUENTES:{}", tail))
            .unwrap_or_default();

        let first_excerpt = context
            .lines()
            .find(|line| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !trimmed.starts_with("---[")
            })
            .unwrap_or("")
            .trim();

        format!(
            "Sobre \"{}\": {} [S1]{}",
            query.trim(),
            first_excerpt,
            sources
        )
    }
}

impl Default for FakeLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMService for FakeLlm {
    async fn generate_answer(&self, query: &str, context: &str) -> Result<String, LLMError> {
        if query.trim().is_empty() {
            return Err(LLMError::EmptyPrompt);
        }
        Ok(Self::compose(query, context))
    }

    async fn generate_text(&self, prompt: &str, max_tokens: u32) -> Result<String, LLMError> {
        if prompt.trim().is_empty() {
            return Err(LLMError::EmptyPrompt);
        }
        // Echo the tail of the prompt, bounded by the token budget.
        let budget = (max_tokens as usize).saturating_mul(4).max(16);
        let text = prompt.trim();
        let start = text.len().saturating_sub(budget);
        let mut cut = start;
        while cut < text.len() && !text.is_char_boundary(cut) {
            cut += 1;
        }
        Ok(text[cut..].to_string())
    }

    async fn generate_stream(
        &self,
        query: &str,
        context: &str,
    ) -> Result<FragmentReceiver, LLMError> {
        if query.trim().is_empty() {
            return Err(LLMError::EmptyPrompt);
        }

        let answer = Self::compose(query, context);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut rest = answer.as_str();
            while !rest.is_empty() {
                let take = rest
                    .char_indices()
                    .map(|(i, c)| i + c.len_utf8())
                    .take_while(|&end| end <= 24)
                    .last()
                    .unwrap_or(rest.len());
                let (fragment, tail) = rest.split_at(take.min(rest.len()));
                if tx.send(Ok(fragment.to_string())).await.is_err() {
                    // Receiver dropped: the consumer cancelled.
                    return;
                }
                rest = tail;
            }
        });
        Ok(rx)
    }
}
