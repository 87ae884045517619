//! Integration tests for the migration engine on embedded datasets.

use std::sync::Arc;

use keel_core::migration::{
    builtin_migrator, BootstrapMode, Migration, MigrationError, Migrator, SCHEMA_MIGRATIONS_DDL,
};
use keel_core::{Backend, BackendConfig};

struct TestContext {
    backend: Arc<Backend>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    async fn new(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(name, BackendConfig::sqlite(dir.path().join("data.db")))
            .await
            .unwrap();
        Self {
            backend: Arc::new(backend),
            _dir: dir,
        }
    }

    fn migrator(&self, migrations: Vec<Migration>) -> Migrator {
        Migrator::new(Arc::clone(&self.backend), migrations).unwrap()
    }

    async fn has_column(&self, table: &str, column: &str) -> bool {
        self.backend
            .query(&format!("SELECT {} FROM {} LIMIT 1", column, table), &[])
            .await
            .is_ok()
    }

    async fn bookkeeping_rows(&self, version: i64) -> i64 {
        self.backend
            .query_i64(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
                &[version.into()],
            )
            .await
            .unwrap()
    }
}

fn create_t_add_x() -> Vec<Migration> {
    vec![
        Migration::new(1, "create table t")
            .up("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .down("DROP TABLE t"),
        Migration::new(2, "add column t.x")
            .up("ALTER TABLE t ADD COLUMN x TEXT")
            .down("ALTER TABLE t DROP COLUMN x"),
    ]
}

#[tokio::test]
async fn test_migrate_then_rollback_example() {
    let ctx = TestContext::new("app").await;
    let migrator = ctx.migrator(create_t_add_x());

    assert_eq!(migrator.version().await.unwrap(), 0);
    assert_eq!(migrator.migrate().await.unwrap(), 2);
    assert_eq!(migrator.version().await.unwrap(), 2);
    assert!(ctx.has_column("t", "x").await);

    assert_eq!(migrator.rollback().await.unwrap(), 1);
    assert_eq!(migrator.version().await.unwrap(), 1);
    assert!(ctx.has_column("t", "name").await);
    assert!(!ctx.has_column("t", "x").await);
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
    let ctx = TestContext::new("app").await;
    let migrator = ctx.migrator(create_t_add_x());

    migrator.migrate().await.unwrap();
    assert_eq!(migrator.migrate().await.unwrap(), 2);

    assert_eq!(ctx.bookkeeping_rows(1).await, 1);
    assert_eq!(ctx.bookkeeping_rows(2).await, 1);
    assert!(migrator.pending().await.unwrap().is_empty());

    let applied = migrator.applied().await.unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[1].description, "add column t.x");
}

#[tokio::test]
async fn test_rollback_migrate_round_trip() {
    let ctx = TestContext::new("app").await;
    let migrator = ctx.migrator(create_t_add_x());

    migrator.migrate().await.unwrap();
    migrator.rollback().await.unwrap();
    migrator.rollback().await.unwrap();
    assert_eq!(migrator.version().await.unwrap(), 0);
    assert!(!ctx.backend.table_exists("t").await.unwrap());

    let err = migrator.rollback().await.unwrap_err();
    assert!(matches!(err, MigrationError::NothingToRollback { .. }));

    assert_eq!(migrator.migrate().await.unwrap(), 2);
    assert!(ctx.has_column("t", "x").await);
}

#[tokio::test]
async fn test_failed_step_leaves_last_recorded_version() {
    let ctx = TestContext::new("app").await;
    let mut migrations = create_t_add_x();
    migrations.push(
        Migration::new(3, "broken")
            .up("CREATE TABLE u (id INTEGER)")
            .up("CREATE TABLE broken (")
            .down("DROP TABLE u"),
    );
    migrations.push(
        Migration::new(4, "never reached")
            .up("CREATE TABLE v (id INTEGER)")
            .down("DROP TABLE v"),
    );
    let migrator = ctx.migrator(migrations);

    let err = migrator.migrate().await.unwrap_err();
    match err {
        MigrationError::StepFailed { version, .. } => assert_eq!(version, 3),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(migrator.version().await.unwrap(), 2);
    assert_eq!(ctx.bookkeeping_rows(3).await, 0);
    assert!(!ctx.backend.table_exists("u").await.unwrap());
    assert!(!ctx.backend.table_exists("v").await.unwrap());

    let pending: Vec<i64> = migrator
        .pending()
        .await
        .unwrap()
        .iter()
        .map(|p| p.version)
        .collect();
    assert_eq!(pending, vec![3, 4]);
}

fn self_bootstrapping() -> Vec<Migration> {
    vec![
        Migration::new(1, "create schema_migrations")
            .up(SCHEMA_MIGRATIONS_DDL)
            .down("DROP TABLE IF EXISTS schema_migrations"),
        Migration::new(2, "create t")
            .up("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .down("DROP TABLE t"),
    ]
}

#[tokio::test]
async fn test_first_migration_bootstrap_records_no_first_row() {
    let ctx = TestContext::new("legacy").await;
    let migrator = ctx
        .migrator(self_bootstrapping())
        .with_bootstrap(BootstrapMode::FirstMigration);

    assert_eq!(migrator.version().await.unwrap(), 0);
    assert_eq!(migrator.migrate().await.unwrap(), 2);
    assert!(ctx.backend.table_exists("t").await.unwrap());

    assert_eq!(ctx.bookkeeping_rows(1).await, 0);
    assert_eq!(ctx.bookkeeping_rows(2).await, 1);

    // The first step is satisfied by the table alone and cannot be reverted.
    assert_eq!(migrator.rollback().await.unwrap(), 1);
    let err = migrator.rollback().await.unwrap_err();
    assert!(matches!(err, MigrationError::NothingToRollback { .. }));
    assert_eq!(migrator.version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_bootstrap_modes_converge() {
    let legacy = TestContext::new("legacy").await;
    let managed = TestContext::new("managed").await;

    let legacy_migrator = legacy
        .migrator(self_bootstrapping())
        .with_bootstrap(BootstrapMode::FirstMigration);
    let managed_migrator = managed.migrator(self_bootstrapping());
    assert_eq!(managed_migrator.bootstrap(), BootstrapMode::Managed);

    assert_eq!(legacy_migrator.migrate().await.unwrap(), 2);
    assert_eq!(managed_migrator.migrate().await.unwrap(), 2);

    assert!(legacy.backend.table_exists("t").await.unwrap());
    assert!(managed.backend.table_exists("t").await.unwrap());

    assert_eq!(managed.bookkeeping_rows(1).await, 1);
    assert_eq!(legacy.bookkeeping_rows(1).await, 0);
}

#[tokio::test]
async fn test_builtin_control_set() {
    let ctx = TestContext::new("control").await;
    let migrator = builtin_migrator(Arc::clone(&ctx.backend)).unwrap();
    assert_eq!(migrator.bootstrap(), BootstrapMode::FirstMigration);

    assert_eq!(migrator.migrate().await.unwrap(), 5);
    for table in ["admins", "sessions", "audit_log", "scheduler_jobs"] {
        assert!(ctx.backend.table_exists(table).await.unwrap(), "{table}");
    }

    let status = migrator.status().await.unwrap();
    assert_eq!(status.dataset, "control");
    assert_eq!(status.current_version, 5);
    assert_eq!(status.latest_version, 5);
    assert!(status.is_up_to_date());
    assert_eq!(status.applied.len(), 4);

    assert_eq!(migrator.rollback().await.unwrap(), 4);
    assert!(!ctx.backend.table_exists("scheduler_jobs").await.unwrap());
}

#[tokio::test]
async fn test_builtin_account_set() {
    let ctx = TestContext::new("account").await;
    let migrator = builtin_migrator(Arc::clone(&ctx.backend)).unwrap();

    assert_eq!(migrator.migrate().await.unwrap(), 2);
    ctx.backend
        .execute(
            "INSERT INTO accounts (email, display_name) VALUES (?, ?)",
            &["a@example.com".into(), "A".into()],
        )
        .await
        .unwrap();
    let status: String = {
        use sqlx::Row;
        let row = ctx
            .backend
            .query_one("SELECT status FROM accounts WHERE email = ?", &["a@example.com".into()])
            .await
            .unwrap()
            .unwrap();
        row.try_get(0).unwrap()
    };
    assert_eq!(status, "active");
}

#[tokio::test]
async fn test_no_builtin_set_for_unknown_dataset() {
    let ctx = TestContext::new("billing").await;
    let err = builtin_migrator(Arc::clone(&ctx.backend)).unwrap_err();
    assert!(matches!(err, MigrationError::NoMigrations(_)));
}
