//! Built-in migration sets for the well-known datasets.
//!
//! Both sets open with a step that creates the bookkeeping table, so they run
//! with [`BootstrapMode::FirstMigration`] to stay compatible with datasets
//! created before bookkeeping was managed by the runner.

use std::sync::Arc;

use super::error::MigrationError;
use super::migrator::{BootstrapMode, Migrator, SCHEMA_MIGRATIONS_DDL};
use super::step::Migration;
use crate::backend::{Backend, Engine};
use crate::config::{ACCOUNT_DATASET, CONTROL_DATASET};

const MYSQL_TABLE_OPTIONS: &str = "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

fn bookkeeping() -> Migration {
    Migration::new(1, "create schema_migrations")
        .up(SCHEMA_MIGRATIONS_DDL)
        .down("DROP TABLE IF EXISTS schema_migrations")
}

/// Steps of the control dataset.
pub fn control_migrations() -> Vec<Migration> {
    vec![
        bookkeeping(),
        Migration::new(2, "create admins")
            .up(
                "CREATE TABLE admins (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 username TEXT NOT NULL UNIQUE, \
                 password_hash TEXT NOT NULL, \
                 email TEXT, \
                 is_active BOOLEAN NOT NULL DEFAULT 1, \
                 created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up_for(
                Engine::Postgres,
                "CREATE TABLE admins (\
                 id BIGSERIAL PRIMARY KEY, \
                 username VARCHAR(255) NOT NULL UNIQUE, \
                 password_hash TEXT NOT NULL, \
                 email TEXT, \
                 is_active BOOLEAN NOT NULL DEFAULT TRUE, \
                 created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up_for(
                Engine::MySql,
                format!(
                    "CREATE TABLE admins (\
                     id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                     username VARCHAR(255) NOT NULL UNIQUE, \
                     password_hash TEXT NOT NULL, \
                     email TEXT, \
                     is_active TINYINT(1) NOT NULL DEFAULT 1, \
                     created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                     updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP) {}",
                    MYSQL_TABLE_OPTIONS
                ),
            )
            .down("DROP TABLE IF EXISTS admins"),
        Migration::new(3, "create sessions")
            .up(
                "CREATE TABLE sessions (\
                 id TEXT PRIMARY KEY, \
                 admin_id INTEGER NOT NULL REFERENCES admins(id) ON DELETE CASCADE, \
                 token_hash TEXT NOT NULL UNIQUE, \
                 user_agent TEXT, \
                 ip_address TEXT, \
                 expires_at DATETIME NOT NULL, \
                 created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up("CREATE INDEX idx_sessions_admin ON sessions (admin_id)")
            .up_for(
                Engine::Postgres,
                "CREATE TABLE sessions (\
                 id VARCHAR(64) PRIMARY KEY, \
                 admin_id BIGINT NOT NULL REFERENCES admins(id) ON DELETE CASCADE, \
                 token_hash VARCHAR(128) NOT NULL UNIQUE, \
                 user_agent TEXT, \
                 ip_address TEXT, \
                 expires_at TIMESTAMP NOT NULL, \
                 created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up_for(Engine::Postgres, "CREATE INDEX idx_sessions_admin ON sessions (admin_id)")
            .up_for(
                Engine::MySql,
                format!(
                    "CREATE TABLE sessions (\
                     id VARCHAR(64) PRIMARY KEY, \
                     admin_id BIGINT NOT NULL, \
                     token_hash VARCHAR(128) NOT NULL UNIQUE, \
                     user_agent TEXT, \
                     ip_address VARCHAR(64), \
                     expires_at DATETIME NOT NULL, \
                     created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                     INDEX idx_sessions_admin (admin_id), \
                     FOREIGN KEY (admin_id) REFERENCES admins(id) ON DELETE CASCADE) {}",
                    MYSQL_TABLE_OPTIONS
                ),
            )
            .down("DROP TABLE IF EXISTS sessions"),
        Migration::new(4, "create audit_log")
            .up(
                "CREATE TABLE audit_log (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 actor TEXT, \
                 action TEXT NOT NULL, \
                 target TEXT, \
                 detail TEXT, \
                 created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up("CREATE INDEX idx_audit_log_created ON audit_log (created_at)")
            .up_for(
                Engine::Postgres,
                "CREATE TABLE audit_log (\
                 id BIGSERIAL PRIMARY KEY, \
                 actor TEXT, \
                 action TEXT NOT NULL, \
                 target TEXT, \
                 detail TEXT, \
                 created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up_for(
                Engine::Postgres,
                "CREATE INDEX idx_audit_log_created ON audit_log (created_at)",
            )
            .up_for(
                Engine::MySql,
                format!(
                    "CREATE TABLE audit_log (\
                     id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                     actor VARCHAR(255), \
                     action VARCHAR(255) NOT NULL, \
                     target TEXT, \
                     detail TEXT, \
                     created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                     INDEX idx_audit_log_created (created_at)) {}",
                    MYSQL_TABLE_OPTIONS
                ),
            )
            .down("DROP TABLE IF EXISTS audit_log"),
        Migration::new(5, "create scheduler_jobs")
            .up(
                "CREATE TABLE scheduler_jobs (\
                 name TEXT PRIMARY KEY, \
                 schedule TEXT NOT NULL, \
                 enabled BOOLEAN NOT NULL DEFAULT 1, \
                 last_run_at DATETIME, \
                 next_run_at DATETIME, \
                 last_status TEXT, \
                 locked_by TEXT, \
                 locked_until DATETIME)",
            )
            .up_for(
                Engine::Postgres,
                "CREATE TABLE scheduler_jobs (\
                 name VARCHAR(255) PRIMARY KEY, \
                 schedule TEXT NOT NULL, \
                 enabled BOOLEAN NOT NULL DEFAULT TRUE, \
                 last_run_at TIMESTAMP, \
                 next_run_at TIMESTAMP, \
                 last_status TEXT, \
                 locked_by TEXT, \
                 locked_until TIMESTAMP)",
            )
            .up_for(
                Engine::MySql,
                format!(
                    "CREATE TABLE scheduler_jobs (\
                     name VARCHAR(255) PRIMARY KEY, \
                     schedule VARCHAR(255) NOT NULL, \
                     enabled TINYINT(1) NOT NULL DEFAULT 1, \
                     last_run_at DATETIME NULL, \
                     next_run_at DATETIME NULL, \
                     last_status TEXT, \
                     locked_by VARCHAR(255), \
                     locked_until DATETIME NULL) {}",
                    MYSQL_TABLE_OPTIONS
                ),
            )
            .down("DROP TABLE IF EXISTS scheduler_jobs"),
    ]
}

/// Steps of the account dataset.
pub fn account_migrations() -> Vec<Migration> {
    vec![
        bookkeeping(),
        Migration::new(2, "create accounts")
            .up(
                "CREATE TABLE accounts (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 email TEXT NOT NULL UNIQUE, \
                 display_name TEXT, \
                 password_hash TEXT, \
                 status TEXT NOT NULL DEFAULT 'active', \
                 created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up("CREATE INDEX idx_accounts_status ON accounts (status)")
            .up_for(
                Engine::Postgres,
                "CREATE TABLE accounts (\
                 id BIGSERIAL PRIMARY KEY, \
                 email VARCHAR(255) NOT NULL UNIQUE, \
                 display_name TEXT, \
                 password_hash TEXT, \
                 status VARCHAR(32) NOT NULL DEFAULT 'active', \
                 created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            )
            .up_for(Engine::Postgres, "CREATE INDEX idx_accounts_status ON accounts (status)")
            .up_for(
                Engine::MySql,
                format!(
                    "CREATE TABLE accounts (\
                     id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                     email VARCHAR(255) NOT NULL UNIQUE, \
                     display_name VARCHAR(255), \
                     password_hash TEXT, \
                     status VARCHAR(32) NOT NULL DEFAULT 'active', \
                     created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                     updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                     INDEX idx_accounts_status (status)) {}",
                    MYSQL_TABLE_OPTIONS
                ),
            )
            .down("DROP TABLE IF EXISTS accounts"),
    ]
}

/// Built-in steps for a dataset name, if it has any.
pub fn migrations_for(dataset: &str) -> Option<Vec<Migration>> {
    match dataset {
        CONTROL_DATASET => Some(control_migrations()),
        ACCOUNT_DATASET => Some(account_migrations()),
        _ => None,
    }
}

/// A migrator over the built-in steps of `backend`'s dataset.
pub fn builtin_migrator(backend: Arc<Backend>) -> Result<Migrator, MigrationError> {
    let migrations = migrations_for(backend.name())
        .ok_or_else(|| MigrationError::NoMigrations(backend.name().to_string()))?;
    Ok(Migrator::new(backend, migrations)?.with_bootstrap(BootstrapMode::FirstMigration))
}
