use thiserror::Error;

/// Task-pipeline failures. Each variant maps to one surfaced error kind;
/// the API layer translates them to HTTP status codes.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("too many requests")]
    RateLimited,

    #[error("blocked host: {0}")]
    BlockedHost(String),

    #[error("remote fetch: {0}")]
    RemoteFetch(String),

    #[error("extract: {0}")]
    Extract(String),

    #[error("task timeout exceeded")]
    TaskTimeout,

    #[error("empty feed")]
    EmptyFeed,

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl TaskError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        TaskError::Internal(err.to_string())
    }
}
