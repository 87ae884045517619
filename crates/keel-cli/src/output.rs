//! Report formatting.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use serde::Serialize;

use keel_cluster::NodeInfo;
use keel_core::MigrationStatus;
use keel_transfer::{MigrationProgress, ProgressPhase, TransferReport};

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Schema versions of every dataset.
pub fn format_status(statuses: &[MigrationStatus], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(statuses);
    }

    let mut table = Table::new();
    table.set_header(vec!["Dataset", "Engine", "Version", "Latest", "Pending"]);
    for status in statuses {
        let pending = if status.pending.is_empty() {
            "-".to_string()
        } else {
            status
                .pending
                .iter()
                .map(|p| format!("{} {}", p.version, p.description))
                .collect::<Vec<_>>()
                .join("\n")
        };
        table.add_row(vec![
            Cell::new(&status.dataset),
            Cell::new(status.engine),
            Cell::new(status.current_version),
            Cell::new(status.latest_version),
            Cell::new(pending),
        ]);
    }
    table.to_string()
}

/// Cluster node listing.
pub fn format_nodes(nodes: &[NodeInfo], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(nodes);
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Node", "Hostname", "Address", "Status", "Primary", "Heartbeat", "Version",
    ]);
    for node in nodes {
        let address = match (&node.address, node.port) {
            (Some(address), Some(port)) => format!("{}:{}", address, port),
            (Some(address), None) => address.clone(),
            (None, _) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&node.node_id),
            Cell::new(&node.hostname),
            Cell::new(address),
            Cell::new(node.status.as_str()),
            Cell::new(if node.is_primary { "yes" } else { "" }),
            Cell::new(node.last_heartbeat.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&node.version),
        ]);
    }
    table.to_string()
}

/// Per-table outcome of a transfer.
pub fn format_report(report: &TransferReport, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(report);
    }

    let mut table = Table::new();
    table.set_header(vec!["Table", "Total", "Migrated", "Skipped", "Error"]);
    for t in &report.tables {
        table.add_row(vec![
            Cell::new(&t.table),
            Cell::new(t.total_rows),
            Cell::new(t.migrated_rows),
            Cell::new(t.skipped_rows),
            Cell::new(t.error.as_deref().unwrap_or("")),
        ]);
    }
    table.to_string()
}

/// One progress line.
pub fn format_progress(event: &MigrationProgress) -> String {
    let table = event.table.as_deref().unwrap_or("-");
    match event.phase {
        ProgressPhase::Migrating => format!(
            "[{}] {} {}/{}",
            event.phase, table, event.migrated_rows, event.total_rows
        ),
        ProgressPhase::Completed => format!("[{}] {} {} rows", event.phase, table, event.migrated_rows),
        ProgressPhase::Error | ProgressPhase::Done => match &event.error {
            Some(error) => format!("[{}] {} {}", event.phase, table, error),
            None => format!("[{}]", event.phase),
        },
    }
}
