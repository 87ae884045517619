//! Core error types.

use thiserror::Error;

/// Errors raised by the backend fabric and dataset manager.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend was used before `connect` or after `close`.
    #[error("backend {0} is not ready")]
    NotReady(String),

    /// Connecting to the engine or the liveness probe failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Error returned by the database driver.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A dataset name that the manager does not hold.
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    /// Value could not be decoded from a result row.
    #[error("decode error: {0}")]
    Decode(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The underlying driver database error, if any.
    pub fn as_database_error(&self) -> Option<&(dyn sqlx::error::DatabaseError + 'static)> {
        match self {
            Error::Database(err) => err.as_database_error(),
            _ => None,
        }
    }

    /// Whether the statement failed on a unique or primary key constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self.as_database_error() {
            Some(db) => {
                db.is_unique_violation()
                    || matches!(db.code().as_deref(), Some("23505") | Some("1062"))
                    || db.message().contains("UNIQUE constraint failed")
                    || db.message().contains("Duplicate entry")
            }
            None => false,
        }
    }

    /// Whether the transaction lost a serialization race or deadlocked.
    ///
    /// These are expected when two nodes contend for the same rows and the
    /// engine aborts one of them.
    pub fn is_serialization_failure(&self) -> bool {
        match self.as_database_error() {
            Some(db) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                    || db.message().contains("database is locked")
                    || db.message().contains("Deadlock found")
            }
            None => false,
        }
    }

    /// Whether a CREATE statement failed because the object already exists.
    pub fn is_already_exists(&self) -> bool {
        match self.as_database_error() {
            Some(db) => {
                matches!(db.code().as_deref(), Some("42P07") | Some("1050"))
                    || db.message().contains("already exists")
            }
            None => false,
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
