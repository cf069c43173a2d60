//! KV error taxonomy: what retries, what surfaces, what rebuilds a watch.

use thiserror::Error;

/// Result type alias for keyspace operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors from the keyspace client or its backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// Client-side deadline or server-side request timeout, including
    /// timeouts attributed to a leader failover. Retried locally.
    #[error("kv request timed out: {0}")]
    Timeout(String),

    /// The connected server has no raft leader. Watch loops rebuild on
    /// this; unary ops surface it.
    #[error("kv backend has no leader")]
    NoLeader,

    #[error("kv operation canceled: {0}")]
    Canceled(String),

    #[error("kv invalid argument: {0}")]
    InvalidArgument(String),

    #[error("kv permission denied: {0}")]
    PermissionDenied(String),

    /// The watch stream ended without a terminal error.
    #[error("watch stream closed")]
    WatchClosed,

    #[error("kv backend error: {0}")]
    Backend(String),
}

impl KvError {
    /// Whether the retry loop should try this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Timeout(_))
    }
}

/// Classify an etcd client error by its rendered message.
///
/// The gRPC status codes behind `etcd_client::Error` are not uniformly
/// exposed across transports, so classification follows the server's
/// well-known error strings.
pub fn classify_etcd_error(err: etcd_client::Error) -> KvError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("no leader") {
        KvError::NoLeader
    } else if lower.contains("deadline exceeded")
        || lower.contains("request timed out")
        || lower.contains("leader fail")
    {
        KvError::Timeout(msg)
    } else if lower.contains("permission denied") {
        KvError::PermissionDenied(msg)
    } else if lower.contains("invalid argument") {
        KvError::InvalidArgument(msg)
    } else if lower.contains("cancel") {
        KvError::Canceled(msg)
    } else {
        KvError::Backend(msg)
    }
}
