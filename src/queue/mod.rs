mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::types::base64_bytes;
use crate::domain::TaskError;

pub use self::redis::RedisAdapter;

/// One cached task result. Entries are written once on success and never
/// mutated; staleness is judged against `stored_at` by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            stored_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Message published on a cache key's completion topic once a worker
/// finishes (or fails) the fetch every subscriber is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<CompletionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct CompletionPayload(#[serde(with = "base64_bytes")] Vec<u8>);

impl Completion {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            payload: Some(CompletionPayload(payload)),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            payload: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>, TaskError> {
        match (self.payload, self.error) {
            (Some(CompletionPayload(bytes)), _) => Ok(bytes),
            (None, Some(message)) => Err(TaskError::Internal(message)),
            (None, None) => Err(TaskError::Internal("empty completion".to_string())),
        }
    }
}

/// Producer side of the work queue: hand in a task, block until some worker
/// publishes the result for its cache key or the deadline passes.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(
        &self,
        cache_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TaskError>;
}

/// Result cache. Doubles as the coalescing rendezvous: an atomic
/// set-if-absent on a per-key pending marker decides which worker owns a
/// fetch; everyone else waits for that owner's completion.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>, TaskError>;
    async fn put(&self, cache_key: &str, value: &[u8], ttl: Duration) -> Result<(), TaskError>;
    /// Atomically writes the short-lived pending marker for this key.
    /// Returns true when this caller now owns the fetch.
    async fn claim(&self, cache_key: &str, ttl: Duration) -> Result<bool, TaskError>;
    /// Removes the pending marker.
    async fn release(&self, cache_key: &str) -> Result<(), TaskError>;
}
