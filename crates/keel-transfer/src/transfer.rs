//! Copying an embedded dataset onto a networked engine.
//!
//! Tables are processed in catalog order. For each one the declaration is
//! translated and created on the target, then rows are streamed from the
//! source and inserted one statement at a time. A row that already exists on
//! the target is skipped, so an interrupted transfer can simply be re-run.
//!
//! Failure scope:
//! - creating a table fails: the whole run aborts
//! - any other row error: that table aborts, the run continues

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use keel_core::backend::decode_row;
use keel_core::{Backend, Engine, Value};

use crate::error::{Result, TransferError};
use crate::progress::{
    MigrationProgress, ProgressPhase, TableReport, TransferReport, DEFAULT_PROGRESS_INTERVAL,
};
use crate::translate::translate_ddl;

const CATALOG_SQL: &str = r"SELECT name, sql FROM sqlite_master
WHERE type = 'table' AND sql IS NOT NULL AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
ORDER BY rowid";

const COLUMNS_SQL: &str = "SELECT name, type FROM pragma_table_info(?) ORDER BY cid";

const POSTGRES_COLUMNS_SQL: &str = "SELECT CAST(column_name AS TEXT), CAST(data_type AS TEXT), \
     CAST(column_default AS TEXT) FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = ?";

/// A table read from the embedded catalog.
#[derive(Debug, Clone)]
struct SourceTable {
    name: String,
    ddl: String,
    columns: Vec<SourceColumn>,
}

#[derive(Debug, Clone)]
struct SourceColumn {
    name: String,
    declared: String,
}

/// How a source column is read so every value decodes through the any driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadAs {
    Native,
    Integer,
    Text,
}

impl SourceColumn {
    fn read_as(&self) -> ReadAs {
        let declared = self.declared.trim().to_ascii_lowercase();
        // Unrecognised declarations decode from the stored value's class.
        match declared.as_str() {
            "boolean" | "bool" => ReadAs::Integer,
            "date" | "time" | "datetime" | "timestamp" => ReadAs::Text,
            _ => ReadAs::Native,
        }
    }

    fn select_expr(&self) -> String {
        let ident = Engine::Sqlite.dialect().quote_ident(&self.name);
        match self.read_as() {
            ReadAs::Native => ident,
            ReadAs::Integer => format!("CAST({ident} AS INTEGER) AS {ident}"),
            ReadAs::Text => format!("CAST({ident} AS TEXT) AS {ident}"),
        }
    }
}

/// Column metadata of a table on the target.
#[derive(Debug, Default)]
struct TargetColumns {
    types: HashMap<String, String>,
    serial: Vec<String>,
}

impl TargetColumns {
    fn cast_type(&self, column: &str) -> Option<&str> {
        self.types
            .get(column)
            .map(String::as_str)
            .filter(|ty| !matches!(*ty, "USER-DEFINED" | "ARRAY"))
    }
}

/// One transfer of an embedded dataset to a networked engine.
pub struct Transfer {
    source: Arc<Backend>,
    target: Arc<Backend>,
    progress_interval: u64,
}

impl Transfer {
    /// Create a transfer from an embedded `source` to a networked `target`.
    ///
    /// Both backends must be connected before [`Transfer::run`].
    pub fn new(source: Arc<Backend>, target: Arc<Backend>) -> Result<Self> {
        if !source.engine().is_embedded() {
            return Err(TransferError::InvalidEndpoints(format!(
                "source dataset {} must be embedded, got {}",
                source.name(),
                source.engine()
            )));
        }
        if !target.engine().is_networked() {
            return Err(TransferError::InvalidEndpoints(format!(
                "target of {} must be a networked engine, got {}",
                source.name(),
                target.engine()
            )));
        }
        Ok(Self::unchecked(source, target))
    }

    pub(crate) fn unchecked(source: Arc<Backend>, target: Arc<Backend>) -> Self {
        Self {
            source,
            target,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Rows between two progress events of the same table.
    pub fn with_progress_interval(mut self, rows: u64) -> Self {
        self.progress_interval = rows.max(1);
        self
    }

    /// The embedded dataset rows are read from.
    pub fn source(&self) -> &Arc<Backend> {
        &self.source
    }

    /// The networked dataset tables are created in.
    pub fn target(&self) -> &Arc<Backend> {
        &self.target
    }

    /// Names of the tables that would be transferred, in order.
    pub async fn source_tables(&self) -> Result<Vec<String>> {
        let rows = self.source.query(CATALOG_SQL, &[]).await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .collect()
    }

    /// Run the transfer.
    ///
    /// Events are pushed to `sink` as tables progress. The last event is
    /// always `done`, after which the sender is dropped and the stream ends.
    pub async fn run(&self, sink: Option<mpsc::Sender<MigrationProgress>>) -> Result<TransferReport> {
        let started_at = Utc::now();
        info!(
            source = %self.source.name(),
            target = %self.target.engine(),
            "transfer started"
        );

        let result = self.copy_tables(&sink, started_at).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        emit(&sink, MigrationProgress::done(started_at, error)).await;
        drop(sink);

        let tables = result?;
        let report = TransferReport {
            source: self.source.name().to_string(),
            target_engine: self.target.engine().to_string(),
            started_at,
            finished_at: Utc::now(),
            tables,
        };
        info!(
            source = %report.source,
            tables = report.tables.len(),
            rows = report.migrated_rows(),
            complete = report.is_complete(),
            "transfer finished"
        );
        Ok(report)
    }

    async fn copy_tables(
        &self,
        sink: &Option<mpsc::Sender<MigrationProgress>>,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<TableReport>> {
        let tables = self.catalog().await?;
        let mut reports = Vec::with_capacity(tables.len());

        for table in &tables {
            let mut report = TableReport::new(&table.name);

            if let Err(e) = self.create_table(table).await {
                report.error = Some(e.to_string());
                emit(sink, MigrationProgress::table(ProgressPhase::Error, &report, started_at)).await;
                return Err(e);
            }

            if let Err(e) = self.copy_rows(table, &mut report, sink, started_at).await {
                report.error = Some(e.to_string());
            }

            let phase = match &report.error {
                Some(error) => {
                    warn!(table = %table.name, error = %error, "table transfer aborted");
                    ProgressPhase::Error
                }
                None => {
                    info!(
                        table = %table.name,
                        rows = report.migrated_rows,
                        skipped = report.skipped_rows,
                        "table transferred"
                    );
                    ProgressPhase::Completed
                }
            };
            emit(sink, MigrationProgress::table(phase, &report, started_at)).await;
            reports.push(report);
        }

        Ok(reports)
    }

    async fn catalog(&self) -> Result<Vec<SourceTable>> {
        let rows = self.source.query(CATALOG_SQL, &[]).await?;
        let mut tables = Vec::with_capacity(rows.len());

        for row in rows {
            let name: String = row.try_get(0)?;
            let ddl: String = row.try_get(1)?;

            let columns = self
                .source
                .query(COLUMNS_SQL, &[Value::from(name.as_str())])
                .await?
                .iter()
                .map(|row| {
                    Ok(SourceColumn {
                        name: row.try_get(0)?,
                        declared: row.try_get::<Option<String>, _>(1)?.unwrap_or_default(),
                    })
                })
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

            tables.push(SourceTable { name, ddl, columns });
        }
        Ok(tables)
    }

    async fn create_table(&self, table: &SourceTable) -> Result<()> {
        let ddl = translate_ddl(&table.ddl, self.target.engine());
        debug!(table = %table.name, ddl = %ddl, "creating table");

        match self.target.execute(&ddl, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(table = %table.name, "table already exists on target");
                Ok(())
            }
            Err(source) => Err(TransferError::Schema {
                table: table.name.clone(),
                source,
            }),
        }
    }

    async fn target_columns(&self, table: &str) -> keel_core::Result<TargetColumns> {
        if self.target.engine() != Engine::Postgres {
            return Ok(TargetColumns::default());
        }

        let mut columns = TargetColumns::default();
        for row in self
            .target
            .query(POSTGRES_COLUMNS_SQL, &[Value::from(table)])
            .await?
        {
            let name: String = row.try_get(0)?;
            let ty: String = row.try_get(1)?;
            let default: Option<String> = row.try_get(2)?;
            if default.is_some_and(|d| d.starts_with("nextval(")) {
                columns.serial.push(name.clone());
            }
            columns.types.insert(name, ty);
        }
        Ok(columns)
    }

    async fn copy_rows(
        &self,
        table: &SourceTable,
        report: &mut TableReport,
        sink: &Option<mpsc::Sender<MigrationProgress>>,
        started_at: DateTime<Utc>,
    ) -> keel_core::Result<()> {
        let source = Engine::Sqlite.dialect();
        let quoted = source.quote_ident(&table.name);
        let total = self
            .source
            .query_i64(&format!("SELECT COUNT(*) FROM {}", quoted), &[])
            .await?;
        report.total_rows = u64::try_from(total).unwrap_or_default();
        emit(sink, MigrationProgress::table(ProgressPhase::Migrating, report, started_at)).await;

        if table.columns.is_empty() {
            return Ok(());
        }

        let target_columns = self.target_columns(&table.name).await?;
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        let select = format!(
            "SELECT {} FROM {}",
            table
                .columns
                .iter()
                .map(SourceColumn::select_expr)
                .collect::<Vec<_>>()
                .join(", "),
            quoted
        );

        let pool = self.source.pool()?;
        let mut rows = sqlx::query(&select).fetch(&pool);
        while let Some(row) = rows.try_next().await? {
            let values = decode_row(&row)?;
            let (sql, params) = self.insert_statement(&table.name, &names, values, &target_columns);

            match self.target.execute(&sql, &params).await {
                Ok(_) => {}
                Err(e) if e.is_unique_violation() => {
                    report.skipped_rows += 1;
                }
                Err(e) => {
                    report.error = Some(e.to_string());
                    break;
                }
            }

            report.migrated_rows += 1;
            if report.migrated_rows % self.progress_interval == 0 {
                emit(sink, MigrationProgress::table(ProgressPhase::Migrating, report, started_at))
                    .await;
            }
        }
        drop(rows);

        // Rows copied before an abort keep their keys, so the reset runs either way.
        let reset = self.reset_sequences(&table.name, &target_columns).await;
        match (&report.error, reset) {
            (Some(_), Err(e)) => {
                warn!(table = %table.name, error = %e, "sequence reset after aborted table failed");
                Ok(())
            }
            (_, reset) => reset,
        }
    }

    /// Build the INSERT for one row in the target's placeholder syntax.
    ///
    /// NULLs are written as literals so typed engines never have to infer a
    /// parameter type from a missing value.
    fn insert_statement(
        &self,
        table: &str,
        columns: &[&str],
        values: Vec<Value>,
        target_columns: &TargetColumns,
    ) -> (String, Vec<Value>) {
        let dialect = self.target.dialect();
        let mut params = Vec::with_capacity(values.len());
        let mut exprs = Vec::with_capacity(values.len());

        for (column, value) in columns.iter().zip(values) {
            if value.is_null() {
                exprs.push("NULL".to_string());
                continue;
            }

            let cast = target_columns.cast_type(column);
            let value = match (cast, value) {
                (Some("boolean"), Value::Integer(v)) => Value::Bool(v != 0),
                (_, value) => value,
            };
            params.push(value);

            let placeholder = dialect.param(params.len());
            exprs.push(match cast {
                Some(ty) => format!("CAST({} AS {})", placeholder, ty),
                None => placeholder,
            });
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote_ident(table),
            columns
                .iter()
                .map(|c| dialect.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            exprs.join(", ")
        );
        (sql, params)
    }

    /// Move serial sequences past the copied keys so later inserts do not
    /// collide with them.
    async fn reset_sequences(&self, table: &str, columns: &TargetColumns) -> keel_core::Result<()> {
        let dialect = self.target.dialect();
        for column in &columns.serial {
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence(?, ?), COALESCE(MAX({}), 0) + 1, false) FROM {}",
                dialect.quote_ident(column),
                dialect.quote_ident(table)
            );
            self.target
                .execute(
                    &sql,
                    &[
                        Value::from(dialect.quote_ident(table)),
                        Value::from(column.as_str()),
                    ],
                )
                .await?;
            debug!(table = %table, column = %column, "sequence reset");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("source", &self.source.name())
            .field("target", &self.target.engine())
            .field("progress_interval", &self.progress_interval)
            .finish()
    }
}

async fn emit(sink: &Option<mpsc::Sender<MigrationProgress>>, event: MigrationProgress) {
    if let Some(sink) = sink {
        if sink.send(event).await.is_err() {
            debug!("progress receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::migration::builtin_migrator;
    use keel_core::BackendConfig;
    use tempfile::TempDir;

    struct Pair {
        _dir: TempDir,
        source: Arc<Backend>,
        target: Arc<Backend>,
    }

    impl Pair {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let source = Backend::open("control", BackendConfig::sqlite(dir.path().join("src.db")))
                .await
                .unwrap();
            let target = Backend::open("target", BackendConfig::sqlite(dir.path().join("dst.db")))
                .await
                .unwrap();
            Self {
                _dir: dir,
                source: Arc::new(source),
                target: Arc::new(target),
            }
        }

        fn transfer(&self) -> Transfer {
            Transfer::unchecked(Arc::clone(&self.source), Arc::clone(&self.target))
        }

        async fn seed(&self) {
            self.source
                .execute(
                    "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     name TEXT NOT NULL UNIQUE, price REAL, note TEXT, \
                     added DATETIME DEFAULT CURRENT_TIMESTAMP, active BOOLEAN DEFAULT 1)",
                    &[],
                )
                .await
                .unwrap();
            self.source
                .execute("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT)", &[])
                .await
                .unwrap();
            for i in 0..5i64 {
                self.source
                    .execute(
                        "INSERT INTO items (name, price, note) VALUES (?, ?, ?)",
                        &[
                            Value::from(format!("item-{}", i)),
                            Value::from(i as f64 * 1.5),
                            if i % 2 == 0 { Value::Null } else { Value::from("odd") },
                        ],
                    )
                    .await
                    .unwrap();
            }
            for i in 1..=3i64 {
                self.source
                    .execute(
                        "INSERT INTO tags (id, label) VALUES (?, ?)",
                        &[Value::from(i), Value::from(format!("tag-{}", i))],
                    )
                    .await
                    .unwrap();
            }
        }
    }

    async fn collect(mut rx: mpsc::Receiver<MigrationProgress>) -> Vec<MigrationProgress> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_read_as() {
        let column = |declared: &str| SourceColumn {
            name: "c".to_string(),
            declared: declared.to_string(),
        };
        assert_eq!(column("INTEGER").read_as(), ReadAs::Native);
        assert_eq!(column("VARCHAR(64)").read_as(), ReadAs::Native);
        assert_eq!(column("").read_as(), ReadAs::Native);
        assert_eq!(column("BOOLEAN").read_as(), ReadAs::Integer);
        assert_eq!(column("DATETIME").read_as(), ReadAs::Text);
        assert_eq!(column("NUMERIC(10,2)").read_as(), ReadAs::Native);
        assert_eq!(column("bool").read_as(), ReadAs::Integer);
        assert_eq!(column("DATETIME").select_expr(), "CAST(\"c\" AS TEXT) AS \"c\"");
    }

    #[tokio::test]
    async fn test_endpoint_validation() {
        let pair = Pair::new().await;
        let err = Transfer::new(Arc::clone(&pair.source), Arc::clone(&pair.target)).unwrap_err();
        assert!(matches!(err, TransferError::InvalidEndpoints(_)));

        let remote = Arc::new(
            Backend::new("remote", BackendConfig::postgres("postgres://localhost/keel")).unwrap(),
        );
        let err = Transfer::new(Arc::clone(&remote), Arc::clone(&pair.target)).unwrap_err();
        assert!(err.to_string().contains("must be embedded"));
        assert!(Transfer::new(Arc::clone(&pair.source), remote).is_ok());
    }

    #[tokio::test]
    async fn test_catalog_order_skips_internal_tables() {
        let pair = Pair::new().await;
        pair.seed().await;

        // AUTOINCREMENT creates sqlite_sequence.
        let tables = pair.transfer().source_tables().await.unwrap();
        assert_eq!(tables, vec!["items".to_string(), "tags".to_string()]);
    }

    #[tokio::test]
    async fn test_transfer_copies_rows_and_reports_progress() {
        let pair = Pair::new().await;
        pair.seed().await;

        let (tx, rx) = mpsc::channel(64);
        let report = pair
            .transfer()
            .with_progress_interval(2)
            .run(Some(tx))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.tables.len(), 2);
        assert_eq!(report.table("items").unwrap().migrated_rows, 5);
        assert_eq!(report.table("tags").unwrap().migrated_rows, 3);

        let copied = pair
            .target
            .query_i64("SELECT COUNT(*) FROM items WHERE note IS NULL", &[])
            .await
            .unwrap();
        assert_eq!(copied, 3);
        let price = pair
            .target
            .query_one("SELECT price FROM items WHERE name = ?", &[Value::from("item-4")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(price.try_get::<f64, _>(0).unwrap(), 6.0);

        // The channel is closed after the final event.
        let events = collect(rx).await;
        let phases: Vec<(ProgressPhase, Option<&str>, u64)> = events
            .iter()
            .map(|e| (e.phase, e.table.as_deref(), e.migrated_rows))
            .collect();
        assert_eq!(
            phases,
            vec![
                (ProgressPhase::Migrating, Some("items"), 0),
                (ProgressPhase::Migrating, Some("items"), 2),
                (ProgressPhase::Migrating, Some("items"), 4),
                (ProgressPhase::Completed, Some("items"), 5),
                (ProgressPhase::Migrating, Some("tags"), 0),
                (ProgressPhase::Migrating, Some("tags"), 2),
                (ProgressPhase::Completed, Some("tags"), 3),
                (ProgressPhase::Done, None, 0),
            ]
        );
        assert!(events.iter().all(|e| e.started_at == report.started_at));
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_rows() {
        let pair = Pair::new().await;
        pair.seed().await;

        pair.transfer().run(None).await.unwrap();
        let report = pair.transfer().run(None).await.unwrap();

        assert!(report.is_complete());
        let items = report.table("items").unwrap();
        assert_eq!(items.total_rows, 5);
        assert_eq!(items.migrated_rows, 5);
        assert_eq!(items.skipped_rows, 5);

        let count = pair
            .target
            .query_i64("SELECT COUNT(*) FROM items", &[])
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_row_failure_aborts_only_that_table() {
        let pair = Pair::new().await;
        pair.seed().await;
        pair.target
            .execute(
                "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT CHECK (label <> 'tag-2'))",
                &[],
            )
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        let report = pair.transfer().run(Some(tx)).await.unwrap();

        assert!(!report.is_complete());
        assert!(report.table("items").unwrap().is_complete());
        let tags = report.table("tags").unwrap();
        assert_eq!(tags.migrated_rows, 1);
        assert!(tags.error.as_deref().unwrap().contains("CHECK"));

        let events = collect(rx).await;
        let last_two: Vec<ProgressPhase> = events.iter().rev().take(2).map(|e| e.phase).collect();
        assert_eq!(last_two, vec![ProgressPhase::Done, ProgressPhase::Error]);
    }

    #[tokio::test]
    async fn test_schema_failure_aborts_run() {
        let pair = Pair::new().await;
        pair.seed().await;
        // Tables and indexes share a namespace.
        pair.target
            .execute("CREATE TABLE other (x INTEGER)", &[])
            .await
            .unwrap();
        pair.target
            .execute("CREATE INDEX tags ON other (x)", &[])
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        let err = pair.transfer().run(Some(tx)).await.unwrap_err();
        match err {
            TransferError::Schema { table, .. } => assert_eq!(table, "tags"),
            other => panic!("unexpected error: {other}"),
        }

        let events = collect(rx).await;
        let done = events.last().unwrap();
        assert!(done.is_done());
        assert!(done.error.as_deref().unwrap().contains("tags"));
        assert_eq!(events[events.len() - 2].phase, ProgressPhase::Error);
    }

    #[tokio::test]
    async fn test_builtin_control_dataset() {
        let pair = Pair::new().await;
        builtin_migrator(Arc::clone(&pair.source))
            .unwrap()
            .migrate()
            .await
            .unwrap();
        pair.source
            .execute(
                "INSERT INTO admins (username, password_hash) VALUES (?, ?)",
                &[Value::from("root"), Value::from("hash")],
            )
            .await
            .unwrap();

        let transfer = pair.transfer();
        let tables = transfer.source_tables().await.unwrap();
        assert_eq!(tables[0], "schema_migrations");

        let report = transfer.run(None).await.unwrap();
        assert!(report.is_complete(), "{:?}", report);

        let row = pair
            .target
            .query_one(
                "SELECT username, CAST(is_active AS INTEGER), CAST(created_at AS TEXT) FROM admins",
                &[],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.try_get::<String, _>(0).unwrap(), "root");
        assert_eq!(row.try_get::<i64, _>(1).unwrap(), 1);
        assert!(!row.try_get::<String, _>(2).unwrap().is_empty());

        let versions = pair
            .target
            .query_i64("SELECT MAX(version) FROM schema_migrations", &[])
            .await
            .unwrap();
        assert_eq!(versions, 5);
    }
}
