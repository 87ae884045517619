//! Keel Transfer - Moving embedded datasets onto networked engines.
//!
//! A single-node deployment keeps its datasets in SQLite files. Growing into
//! a cluster means moving the control dataset onto a shared engine:
//!
//! 1. [`backup_dataset`] copies the file to a timestamped backup
//! 2. [`Transfer::run`] recreates every table on the target and copies rows
//!
//! ```ignore
//! use keel_transfer::{backup_dataset, Transfer};
//!
//! backup_dataset(&source, None).await?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{} {:?}", event.phase, event.table);
//!     }
//! });
//! let report = Transfer::new(source, target)?.run(Some(tx)).await?;
//! ```

pub mod backup;
pub mod error;
pub mod progress;
pub mod transfer;
pub mod translate;

pub use backup::{backup_dataset, backup_file, backup_path};
pub use error::{Result, TransferError};
pub use progress::{MigrationProgress, ProgressPhase, TableReport, TransferReport};
pub use transfer::Transfer;
pub use translate::translate_ddl;
