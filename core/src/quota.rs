use crate::config::QuotaConfig;
use crate::model::{UserId, WorkspaceId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const HOUR_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaResource {
    Messages,
    Tokens,
    Uploads,
}

impl QuotaResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaResource::Messages => "messages",
            QuotaResource::Tokens => "tokens",
            QuotaResource::Uploads => "uploads",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuotaScope {
    Workspace(WorkspaceId),
    User(UserId),
}

impl QuotaScope {
    fn key(&self) -> String {
        match self {
            QuotaScope::Workspace(id) => format!("workspace:{}", id),
            QuotaScope::User(id) => format!("user:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Seconds until the next hour boundary; zero when allowed.
    pub retry_after_seconds: u64,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sliding-window limiter over hourly buckets.
///
/// The production backend must implement atomic increment-with-limit; this
/// in-memory variant is single-process only.
pub trait QuotaLimiter: Send + Sync {
    fn check(&self, resource: QuotaResource, scope: &QuotaScope) -> QuotaDecision;

    fn record(&self, resource: QuotaResource, scope: &QuotaScope, amount: u64);
}

type BucketKey = (String, &'static str, i64);

pub struct InMemoryQuotaLimiter {
    limits: HashMap<QuotaResource, u64>,
    counters: Mutex<HashMap<BucketKey, u64>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQuotaLimiter {
    pub fn new(config: &QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = HashMap::from([
            (QuotaResource::Messages, config.messages_per_hour),
            (QuotaResource::Tokens, config.tokens_per_hour),
            (QuotaResource::Uploads, config.uploads_per_hour),
        ]);
        Self {
            limits,
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn bucket(&self, resource: QuotaResource, scope: &QuotaScope) -> (BucketKey, i64) {
        let now = self.clock.now().timestamp();
        let hour_floor = now.div_euclid(HOUR_SECONDS) * HOUR_SECONDS;
        ((scope.key(), resource.as_str(), hour_floor), now)
    }
}

impl QuotaLimiter for InMemoryQuotaLimiter {
    fn check(&self, resource: QuotaResource, scope: &QuotaScope) -> QuotaDecision {
        let limit = self.limits.get(&resource).copied().unwrap_or(u64::MAX);
        let (key, now) = self.bucket(resource, scope);

        let used = {
            let counters = self.counters.lock().unwrap();
            counters.get(&key).copied().unwrap_or(0)
        };

        if used < limit {
            QuotaDecision {
                allowed: true,
                remaining: limit - used,
                retry_after_seconds: 0,
            }
        } else {
            let hour_floor = key.2;
            let retry_after = (hour_floor + HOUR_SECONDS - now).max(0) as u64;
            QuotaDecision {
                allowed: false,
                remaining: 0,
                retry_after_seconds: retry_after,
            }
        }
    }

    fn record(&self, resource: QuotaResource, scope: &QuotaScope, amount: u64) {
        let (key, _) = self.bucket(resource, scope);
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(amount);
    }
}
