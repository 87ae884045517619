//! Transfer error types.

use thiserror::Error;

/// Errors raised while transferring or backing up a dataset.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Source or target is not the kind of engine the operation needs.
    #[error("invalid transfer: {0}")]
    InvalidEndpoints(String),

    /// Creating a table on the target failed. Aborts the whole run.
    #[error("schema error on table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: keel_core::Error,
    },

    /// Backend error outside of per-row copying.
    #[error(transparent)]
    Core(#[from] keel_core::Error),

    /// Error from the SQLite backup API.
    #[error("backup error: {0}")]
    Backup(#[from] rusqlite::Error),

    /// The backup integrity check did not report `ok`.
    #[error("backup integrity check failed: {0}")]
    Integrity(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<sqlx::Error> for TransferError {
    fn from(err: sqlx::Error) -> Self {
        TransferError::Core(keel_core::Error::Database(err))
    }
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransferError::Schema {
            table: "admins".to_string(),
            source: keel_core::Error::Config("boom".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "schema error on table admins: configuration error: boom"
        );

        let err = TransferError::InvalidEndpoints("source must be embedded".to_string());
        assert!(err.to_string().contains("source must be embedded"));
    }
}
