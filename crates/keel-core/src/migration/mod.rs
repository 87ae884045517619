//! Versioned schema migrations.
//!
//! Each dataset owns an ordered list of hand-authored [`Migration`] steps.
//! The [`Migrator`] applies every step above the recorded version, one
//! transaction per step, and reverts the highest recorded step on rollback.
//!
//! # Example
//!
//! ```ignore
//! use keel_core::migration::{Migration, Migrator};
//!
//! let migrator = Migrator::new(backend, vec![
//!     Migration::new(1, "create t").up("CREATE TABLE t (id INTEGER)").down("DROP TABLE t"),
//!     Migration::new(2, "add t.x").up("ALTER TABLE t ADD COLUMN x TEXT").down("ALTER TABLE t DROP COLUMN x"),
//! ])?;
//!
//! assert_eq!(migrator.migrate().await?, 2);
//! assert_eq!(migrator.rollback().await?, 1);
//! ```

pub mod builtin;
pub mod error;
pub mod migrator;
pub mod step;

pub use builtin::{account_migrations, builtin_migrator, control_migrations, migrations_for};
pub use error::MigrationError;
pub use migrator::{
    AppliedMigration, BootstrapMode, MigrationStatus, Migrator, PendingMigration,
    SCHEMA_MIGRATIONS_DDL, SCHEMA_MIGRATIONS_TABLE,
};
pub use step::{Migration, Statements};
