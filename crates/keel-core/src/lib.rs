//! Keel Core - Backend fabric, datasets, and schema migrations.
//!
//! This crate binds each logical dataset of the control-plane store to one SQL
//! engine and evolves its schema in ordered, reversible steps.

pub mod backend;
pub mod clock;
pub mod config;
pub mod dataset;
pub mod error;
pub mod migration;

pub use backend::{Backend, Dialect, Engine, Placeholder, Tx, UpsertSyntax, Value};
pub use config::{BackendConfig, DatasetConfig, ACCOUNT_DATASET, CONTROL_DATASET};
pub use dataset::{DatasetManager, DeploymentMode};
pub use error::{Error, Result};
pub use migration::{BootstrapMode, Migration, MigrationError, MigrationStatus, Migrator};
