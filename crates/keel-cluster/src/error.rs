//! Error types for keel-cluster.

use thiserror::Error;

/// Errors raised by cluster membership.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Backend error.
    #[error("storage error: {0}")]
    Storage(#[from] keel_core::Error),

    /// A database call exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The operation has no meaning for a standalone node.
    #[error("{0} is not available in standalone mode")]
    Standalone(&'static str),

    /// The primary cannot leave without another online node to take over.
    #[error("no other online node can take over as primary")]
    NoSuccessor,

    /// The membership component has not been started.
    #[error("cluster membership is not started")]
    NotStarted,

    /// The join token is unknown, expired, or already used.
    #[error("join token is invalid, expired, or already used")]
    InvalidToken,

    /// A stored node row could not be interpreted.
    #[error("invalid node record: {0}")]
    InvalidRecord(String),

    /// Error during serialization/deserialization.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for ClusterError {
    fn from(err: sqlx::Error) -> Self {
        ClusterError::Storage(err.into())
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
