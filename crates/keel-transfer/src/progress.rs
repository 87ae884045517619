//! Progress events and the final transfer report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of rows between two `Migrating` events of one table.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1000;

/// Phase carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    /// Rows of `table` are being copied.
    Migrating,
    /// Every row of `table` was processed.
    Completed,
    /// `table` was aborted, see `error`.
    Error,
    /// Last event of the run.
    Done,
}

impl ProgressPhase {
    /// Lowercase name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Migrating => "migrating",
            ProgressPhase::Completed => "completed",
            ProgressPhase::Error => "error",
            ProgressPhase::Done => "done",
        }
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event pushed through the progress sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub phase: ProgressPhase,
    /// Table the event refers to; `None` for `Done`.
    pub table: Option<String>,
    pub total_rows: u64,
    pub migrated_rows: u64,
    /// When the whole run started.
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl MigrationProgress {
    pub(crate) fn table(
        phase: ProgressPhase,
        report: &TableReport,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            phase,
            table: Some(report.table.clone()),
            total_rows: report.total_rows,
            migrated_rows: report.migrated_rows,
            started_at,
            error: report.error.clone(),
        }
    }

    pub(crate) fn done(started_at: DateTime<Utc>, error: Option<String>) -> Self {
        Self {
            phase: ProgressPhase::Done,
            table: None,
            total_rows: 0,
            migrated_rows: 0,
            started_at,
            error,
        }
    }

    /// Whether this is the terminal event.
    pub fn is_done(&self) -> bool {
        self.phase == ProgressPhase::Done
    }
}

/// Outcome of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub total_rows: u64,
    /// Rows inserted plus rows skipped as duplicates.
    pub migrated_rows: u64,
    /// Rows that already existed on the target.
    pub skipped_rows: u64,
    /// Error that aborted the table, if any.
    pub error: Option<String>,
}

impl TableReport {
    pub(crate) fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            total_rows: 0,
            migrated_rows: 0,
            skipped_rows: 0,
            error: None,
        }
    }

    /// Whether every source row reached the target and nothing aborted.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.migrated_rows == self.total_rows
    }
}

/// Outcome of a whole transfer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub source: String,
    pub target_engine: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableReport>,
}

impl TransferReport {
    /// Whether every table was copied without an abort.
    pub fn is_complete(&self) -> bool {
        self.tables.iter().all(TableReport::is_complete)
    }

    pub fn failed_tables(&self) -> impl Iterator<Item = &TableReport> {
        self.tables.iter().filter(|t| t.error.is_some())
    }

    pub fn migrated_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.migrated_rows).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }
}
