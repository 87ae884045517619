//! Timestamped copies of embedded dataset files.
//!
//! Copies go through SQLite's online backup API, so a dataset can be backed up
//! while other connections hold it open. Every copy is verified with
//! `PRAGMA quick_check` before it is reported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::info;

use keel_core::Backend;

use crate::error::{Result, TransferError};

/// Pages copied per backup step.
const PAGES_PER_STEP: i32 = 64;

/// Pause between backup steps, letting writers make progress.
const STEP_PAUSE: Duration = Duration::from_millis(20);

/// Path of the backup taken at `at`: `<file>.backup-YYYYMMDD-HHMMSS`, placed in
/// `dir` or next to the source.
pub fn backup_path(source: &Path, dir: Option<&Path>, at: DateTime<Utc>) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let name = format!("{}.backup-{}", file_name, at.format("%Y%m%d-%H%M%S"));

    match dir {
        Some(dir) => dir.join(name),
        None => source.with_file_name(name),
    }
}

/// First free path derived from `path`, appending `-1`, `-2`, ... when a
/// backup from the same second already exists.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let base = path.as_os_str().to_string_lossy().into_owned();
    let mut n = 1;
    loop {
        let candidate = PathBuf::from(format!("{}-{}", base, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Copy the SQLite file at `source` into a new timestamped backup file.
///
/// Blocks the calling thread; see [`backup_dataset`] for async callers.
pub fn backup_file(source: &Path, dir: Option<&Path>) -> Result<PathBuf> {
    if !source.is_file() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("dataset file {} does not exist", source.display()),
        )));
    }
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }

    let target = unique_path(backup_path(source, dir, Utc::now()));
    let src = Connection::open(source)?;
    let mut dst = Connection::open(&target)?;

    {
        let backup = Backup::new(&src, &mut dst)?;
        backup.run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)?;
    }

    let integrity: String = dst.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if integrity != "ok" {
        return Err(TransferError::Integrity(format!(
            "{}: {}",
            target.display(),
            integrity
        )));
    }

    info!(
        source = %source.display(),
        backup = %target.display(),
        "dataset backed up"
    );
    Ok(target)
}

/// Back up the file of an embedded dataset.
pub async fn backup_dataset(backend: &Backend, dir: Option<PathBuf>) -> Result<PathBuf> {
    if !backend.engine().is_embedded() {
        return Err(TransferError::InvalidEndpoints(format!(
            "dataset {} uses {}, only embedded datasets can be backed up",
            backend.name(),
            backend.engine()
        )));
    }
    let source = backend.config().path.clone().ok_or_else(|| {
        keel_core::Error::Config(format!("dataset {} has no database path", backend.name()))
    })?;

    tokio::task::spawn_blocking(move || backup_file(&source, dir.as_deref())).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keel_core::BackendConfig;
    use tempfile::TempDir;

    fn seed(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t (name) VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
    }

    #[test]
    fn test_backup_path_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let path = backup_path(Path::new("/data/control.db"), None, at);
        assert_eq!(path, PathBuf::from("/data/control.db.backup-20240309-070501"));

        let path = backup_path(Path::new("/data/control.db"), Some(Path::new("/backups")), at);
        assert_eq!(path, PathBuf::from("/backups/control.db.backup-20240309-070501"));
    }

    #[test]
    fn test_backup_copies_rows() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("control.db");
        seed(&source);

        let backup = backup_file(&source, None).unwrap();
        assert_eq!(backup.parent(), Some(dir.path()));
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("control.db.backup-"));

        let conn = Connection::open(&backup).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_backups_in_same_second_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("account.db");
        seed(&source);
        let out = dir.path().join("backups");

        let first = backup_file(&source, Some(&out)).unwrap();
        let second = backup_file(&source, Some(&out)).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&out));
        assert!(second.exists());
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = backup_file(&dir.path().join("nope.db"), None).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn test_backup_open_dataset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.db");
        let backend = Backend::open("control", BackendConfig::sqlite(&path))
            .await
            .unwrap();
        backend
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        backend
            .execute("INSERT INTO t (id) VALUES (1)", &[])
            .await
            .unwrap();

        let backup = backup_dataset(&backend, None).await.unwrap();
        let conn = Connection::open(&backup).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        backend.close().await;
    }

    #[tokio::test]
    async fn test_networked_dataset_rejected() {
        let backend =
            Backend::new("control", BackendConfig::postgres("postgres://localhost/keel")).unwrap();
        let err = backup_dataset(&backend, None).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidEndpoints(_)));
    }
}
