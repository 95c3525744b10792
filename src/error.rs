//! Error types for the option-chain aggregation service

use thiserror::Error;

/// Feed and pipeline errors
///
/// Only `AuthRequired` and startup failures (`Registry`, `Config`) are
/// expected to reach the top-level caller; everything else is absorbed
/// locally with a counter.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("REST API error: {0}")]
    Rest(String),

    #[error("rate limited by broker, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("queue {queue} full (capacity {capacity})")]
    QueueOverflow { queue: &'static str, capacity: usize },

    #[error("strategy {name} failed: {reason}")]
    Strategy { name: String, reason: String },

    #[error("broadcast handler {name} failed: {reason}")]
    Broadcast { name: String, reason: String },

    #[error("instrument registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("shutting down")]
    Shutdown,
}

impl FeedError {
    /// Whether the error should be retried with backoff rather than surfaced
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeedError::Transport(_)
                | FeedError::Rest(_)
                | FeedError::RateLimited { .. }
                | FeedError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::ConnectionTimeout
        } else {
            FeedError::Rest(err.to_string())
        }
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::Ipc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FeedError::Transport("reset".into()).is_transient());
        assert!(FeedError::RateLimited { retry_after_ms: 500 }.is_transient());
        assert!(!FeedError::AuthRequired("token expired".into()).is_transient());
        assert!(!FeedError::Decode("truncated".into()).is_transient());
    }
}
