//! Migration-specific error types.

use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two registered steps share a version.
    #[error("duplicate migration version {0}")]
    DuplicateVersion(i64),

    /// Versions must be positive.
    #[error("invalid migration version {0}: versions start at 1")]
    InvalidVersion(i64),

    /// Rollback was requested with no recorded step.
    #[error("nothing to roll back on dataset {dataset}")]
    NothingToRollback {
        /// The dataset that was asked to roll back.
        dataset: String,
    },

    /// The dataset records a version that is not registered.
    #[error("dataset {dataset} records unknown migration version {version}")]
    UnknownVersion {
        /// The dataset.
        dataset: String,
        /// The recorded version.
        version: i64,
    },

    /// No built-in migration set exists for the dataset name.
    #[error("no migrations registered for dataset {0}")]
    NoMigrations(String),

    /// A step failed and its transaction was rolled back.
    #[error("migration {version} ({description}) failed: {source}")]
    StepFailed {
        /// Version of the failed step.
        version: i64,
        /// Description of the failed step.
        description: String,
        /// The failure.
        #[source]
        source: crate::error::Error,
    },

    /// Backend error outside a step.
    #[error(transparent)]
    Core(#[from] crate::error::Error),
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Core(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::StepFailed {
            version: 3,
            description: "create sessions".to_string(),
            source: crate::error::Error::Decode("boom".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("migration 3"));
        assert!(msg.contains("create sessions"));

        let err = MigrationError::NothingToRollback {
            dataset: "control".to_string(),
        };
        assert_eq!(err.to_string(), "nothing to roll back on dataset control");
    }
}
