use crate::embedding::EmbeddingError;
use crate::llm::LLMError;
use atalaya_core::config::RetryConfig;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storage::file_storage::StorageError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
}

/// HTTP-status classification shared by all providers: timeouts, throttling
/// and server faults retry; client faults fail fast.
pub fn classify_status(status: u16) -> RetryClass {
    match status {
        408 | 429 => RetryClass::Transient,
        501 => RetryClass::Permanent,
        500..=599 => RetryClass::Transient,
        _ => RetryClass::Permanent,
    }
}

const TRANSIENT_MARKERS: [&str; 6] = [
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "slow down",
    "temporarily",
];

/// Errors without a status code are retried only when the surface clearly
/// indicates retryability.
pub fn classify_message(message: &str) -> RetryClass {
    let lowered = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        RetryClass::Transient
    } else {
        RetryClass::Permanent
    }
}

pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

impl Retryable for EmbeddingError {
    fn retry_class(&self) -> RetryClass {
        match self {
            EmbeddingError::Provider { status, message } => status
                .map(classify_status)
                .unwrap_or_else(|| classify_message(message)),
            _ => RetryClass::Permanent,
        }
    }
}

impl Retryable for LLMError {
    fn retry_class(&self) -> RetryClass {
        match self {
            LLMError::Provider { status, message } => status
                .map(classify_status)
                .unwrap_or_else(|| classify_message(message)),
            _ => RetryClass::Permanent,
        }
    }
}

impl Retryable for StorageError {
    fn retry_class(&self) -> RetryClass {
        match self {
            StorageError::Unavailable(_) => RetryClass::Transient,
            _ => RetryClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(config.base_delay_seconds.max(0.0)),
            max_delay: Duration::from_secs_f64(config.max_delay_seconds.max(0.0)),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn backoff(&self, op_name: &str, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        // Equal jitter: half fixed, half spread over [0, exp/2).
        let half = exp / 2;
        half + half.mul_f64(jitter_fraction(op_name, attempt))
    }
}

fn jitter_fraction(op_name: &str, attempt: u32) -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(op_name.as_bytes());
    hasher.update(attempt.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    let digest = hasher.finalize();
    u16::from_le_bytes([digest[0], digest[1]]) as f64 / u16::MAX as f64
}

/// Runs `operation` under the policy. Transient failures back off and retry
/// until the attempt budget runs out, then the original error is re-raised.
/// Log lines carry the attempt number and sleep, never payloads.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = err.retry_class();
                if class == RetryClass::Permanent || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let sleep = policy.backoff(op_name, attempt);
                warn!(
                    op = op_name,
                    attempt,
                    class = "transient",
                    sleep_ms = sleep.as_millis() as u64,
                    "retrying after {}",
                    err
                );
                tokio::time::sleep(sleep).await;
                attempt += 1;
            }
        }
    }
}
