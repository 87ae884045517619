//! Versioned migration runner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info};

use super::error::MigrationError;
use super::step::Migration;
use crate::backend::{Backend, Engine, Value};
use crate::clock::{from_unix, unix_now};

/// Bookkeeping table holding one row per applied step.
pub const SCHEMA_MIGRATIONS_TABLE: &str = "schema_migrations";

/// DDL of the bookkeeping table, valid on every supported engine.
pub const SCHEMA_MIGRATIONS_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
     version BIGINT PRIMARY KEY, \
     description TEXT NOT NULL, \
     applied_at BIGINT NOT NULL)";

/// How the bookkeeping table comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    /// The runner creates the bookkeeping table and records every step.
    #[default]
    Managed,
    /// The first registered step creates the bookkeeping table.
    ///
    /// When the table is missing the first step runs outside bookkeeping and
    /// no row is recorded for it; its version counts as applied whenever the
    /// table exists.
    FirstMigration,
}

/// A recorded step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Step version.
    pub version: i64,
    /// Step description at the time it was applied.
    pub description: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

/// A registered step not yet applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    /// Step version.
    pub version: i64,
    /// Step description.
    pub description: String,
}

/// Summary of one dataset's schema state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Dataset name.
    pub dataset: String,
    /// Engine of the dataset.
    pub engine: Engine,
    /// Current version.
    pub current_version: i64,
    /// Highest registered version.
    pub latest_version: i64,
    /// Recorded steps.
    pub applied: Vec<AppliedMigration>,
    /// Steps above the current version.
    pub pending: Vec<PendingMigration>,
}

impl MigrationStatus {
    /// Whether every registered step is applied.
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies and reverts the registered steps of one dataset.
pub struct Migrator {
    backend: Arc<Backend>,
    migrations: Vec<Migration>,
    bootstrap: BootstrapMode,
}

impl Migrator {
    /// Register `migrations`, sorted by version.
    ///
    /// Duplicate or non-positive versions are rejected.
    pub fn new(backend: Arc<Backend>, mut migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        migrations.sort_by_key(Migration::version);

        for (index, migration) in migrations.iter().enumerate() {
            if migration.version() < 1 {
                return Err(MigrationError::InvalidVersion(migration.version()));
            }
            if index > 0 && migrations[index - 1].version() == migration.version() {
                return Err(MigrationError::DuplicateVersion(migration.version()));
            }
        }

        Ok(Self {
            backend,
            migrations,
            bootstrap: BootstrapMode::default(),
        })
    }

    /// Set the bootstrap mode.
    pub fn with_bootstrap(mut self, mode: BootstrapMode) -> Self {
        self.bootstrap = mode;
        self
    }

    /// The bootstrap mode.
    pub fn bootstrap(&self) -> BootstrapMode {
        self.bootstrap
    }

    /// Registered steps in ascending order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// The dataset backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Highest registered version, zero when nothing is registered.
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map(Migration::version).unwrap_or(0)
    }

    /// Current version of the dataset.
    ///
    /// Zero when the bookkeeping table is missing or empty.
    pub async fn version(&self) -> Result<i64, MigrationError> {
        if !self.backend.table_exists(SCHEMA_MIGRATIONS_TABLE).await? {
            return Ok(0);
        }

        let recorded = self
            .backend
            .query_i64("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", &[])
            .await?;

        match self.bootstrap {
            BootstrapMode::Managed => Ok(recorded),
            BootstrapMode::FirstMigration => {
                let first = self.migrations.first().map(Migration::version).unwrap_or(0);
                Ok(recorded.max(first))
            }
        }
    }

    /// Recorded steps in ascending order.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        if !self.backend.table_exists(SCHEMA_MIGRATIONS_TABLE).await? {
            return Ok(Vec::new());
        }

        let rows = self
            .backend
            .query(
                "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<AppliedMigration, MigrationError> {
                Ok(AppliedMigration {
                    version: row.try_get::<i64, _>(0)?,
                    description: row.try_get::<String, _>(1)?,
                    applied_at: from_unix(row.try_get::<i64, _>(2)?),
                })
            })
            .collect()
    }

    /// Registered steps above the current version.
    pub async fn pending(&self) -> Result<Vec<PendingMigration>, MigrationError> {
        let current = self.version().await?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version() > current)
            .map(|m| PendingMigration {
                version: m.version(),
                description: m.description().to_string(),
            })
            .collect())
    }

    /// Summary of the dataset's schema state.
    pub async fn status(&self) -> Result<MigrationStatus, MigrationError> {
        Ok(MigrationStatus {
            dataset: self.backend.name().to_string(),
            engine: self.backend.engine(),
            current_version: self.version().await?,
            latest_version: self.latest_version(),
            applied: self.applied().await?,
            pending: self.pending().await?,
        })
    }

    /// Apply every step above the current version, in ascending order.
    ///
    /// Each step commits in its own transaction. The first failure is returned
    /// and later steps are not attempted. Returns the resulting version.
    pub async fn migrate(&self) -> Result<i64, MigrationError> {
        self.bootstrap_table().await?;

        let start = self.version().await?;
        let mut current = start;
        let engine = self.backend.engine();

        for migration in self.migrations.iter().filter(|m| m.version() > start) {
            self.apply(migration, engine).await.map_err(|source| {
                MigrationError::StepFailed {
                    version: migration.version(),
                    description: migration.description().to_string(),
                    source,
                }
            })?;

            current = migration.version();
            info!(
                dataset = %self.backend.name(),
                version = migration.version(),
                description = %migration.description(),
                "migration applied"
            );
        }

        Ok(current)
    }

    /// Revert the highest recorded step. Returns the resulting version.
    pub async fn rollback(&self) -> Result<i64, MigrationError> {
        let top = self.applied().await?.into_iter().last().ok_or_else(|| {
            MigrationError::NothingToRollback {
                dataset: self.backend.name().to_string(),
            }
        })?;

        let migration = self
            .migrations
            .iter()
            .find(|m| m.version() == top.version)
            .ok_or_else(|| MigrationError::UnknownVersion {
                dataset: self.backend.name().to_string(),
                version: top.version,
            })?;

        self.revert(migration, self.backend.engine())
            .await
            .map_err(|source| MigrationError::StepFailed {
                version: migration.version(),
                description: migration.description().to_string(),
                source,
            })?;

        info!(
            dataset = %self.backend.name(),
            version = migration.version(),
            description = %migration.description(),
            "migration rolled back"
        );

        self.version().await
    }

    async fn bootstrap_table(&self) -> Result<(), MigrationError> {
        match self.bootstrap {
            BootstrapMode::Managed => {
                self.backend.execute(SCHEMA_MIGRATIONS_DDL, &[]).await?;
                Ok(())
            }
            BootstrapMode::FirstMigration => {
                if self.backend.table_exists(SCHEMA_MIGRATIONS_TABLE).await? {
                    return Ok(());
                }
                let Some(first) = self.migrations.first() else {
                    return Ok(());
                };

                self.run_first(first).await.map_err(|source| MigrationError::StepFailed {
                    version: first.version(),
                    description: first.description().to_string(),
                    source,
                })?;

                info!(
                    dataset = %self.backend.name(),
                    version = first.version(),
                    "bookkeeping table bootstrapped by first migration"
                );
                Ok(())
            }
        }
    }

    async fn run_first(&self, first: &Migration) -> crate::error::Result<()> {
        let mut tx = self.backend.begin().await?;
        for sql in first.up_statements(self.backend.engine()) {
            tx.execute(sql, &[]).await?;
        }
        tx.commit().await?;

        if self.backend.table_exists(SCHEMA_MIGRATIONS_TABLE).await? {
            Ok(())
        } else {
            Err(crate::error::Error::Config(format!(
                "first migration did not create {}",
                SCHEMA_MIGRATIONS_TABLE
            )))
        }
    }

    async fn apply(&self, migration: &Migration, engine: Engine) -> crate::error::Result<()> {
        let mut tx = self.backend.begin().await?;
        for sql in migration.up_statements(engine) {
            debug!(version = migration.version(), sql = %sql, "forward statement");
            tx.execute(sql, &[]).await?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
            &[
                Value::from(migration.version()),
                Value::from(migration.description()),
                Value::from(unix_now()),
            ],
        )
        .await?;
        tx.commit().await
    }

    async fn revert(&self, migration: &Migration, engine: Engine) -> crate::error::Result<()> {
        let mut tx = self.backend.begin().await?;
        tx.execute(
            "DELETE FROM schema_migrations WHERE version = ?",
            &[Value::from(migration.version())],
        )
        .await?;
        for sql in migration.down_statements(engine) {
            debug!(version = migration.version(), sql = %sql, "reverse statement");
            tx.execute(sql, &[]).await?;
        }
        tx.commit().await
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("dataset", &self.backend.name())
            .field("migrations", &self.migrations.len())
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    async fn open(dir: &tempfile::TempDir) -> Arc<Backend> {
        Arc::new(
            Backend::open("test", BackendConfig::sqlite(dir.path().join("m.db")))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_invalid_versions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;

        let err = Migrator::new(
            Arc::clone(&backend),
            vec![Migration::new(2, "a"), Migration::new(1, "b"), Migration::new(2, "c")],
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateVersion(2)));

        let err = Migrator::new(backend, vec![Migration::new(0, "zero")]).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidVersion(0)));
    }

    #[tokio::test]
    async fn test_sorted_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let migrator = Migrator::new(
            backend,
            vec![Migration::new(3, "c"), Migration::new(1, "a"), Migration::new(2, "b")],
        )
        .unwrap();

        let versions: Vec<i64> = migrator.migrations().iter().map(Migration::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(migrator.latest_version(), 3);
        assert_eq!(migrator.version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_with_nothing_applied() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let migrator = Migrator::new(backend, vec![Migration::new(1, "a").up("CREATE TABLE a (id INTEGER)")])
            .unwrap();

        let err = migrator.rollback().await.unwrap_err();
        assert!(matches!(err, MigrationError::NothingToRollback { .. }));
    }
}
