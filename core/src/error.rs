use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes exposed by every typed failure. Transports may format
/// these (e.g. as RFC7807) but must not invent new codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    ServiceUnavailable,
    Missing,
    EmbeddingError,
    LlmError,
    StorageError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Missing => "MISSING",
            ErrorCode::EmbeddingError => "EMBEDDING_ERROR",
            ErrorCode::LlmError => "LLM_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// The error envelope every use case surfaces to its caller.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Missing, message)
    }
}

/// Implemented by module errors so transports can map them onto the envelope
/// without inspecting variants.
pub trait CodedError: std::error::Error {
    fn error_code(&self) -> ErrorCode;

    fn to_service_error(&self) -> ServiceError {
        ServiceError::new(self.error_code(), self.to_string())
    }
}

impl CodedError for ServiceError {
    fn error_code(&self) -> ErrorCode {
        self.code
    }
}
