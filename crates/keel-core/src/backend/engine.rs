//! Supported engines and their dialect facts.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A supported SQL engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Embedded single-file engine.
    Sqlite,
    /// Networked PostgreSQL.
    Postgres,
    /// Networked MySQL / MariaDB.
    MySql,
}

impl Engine {
    /// Canonical engine name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Postgres => "postgres",
            Engine::MySql => "mysql",
        }
    }

    /// Whether the engine stores data in a local file.
    pub fn is_embedded(&self) -> bool {
        matches!(self, Engine::Sqlite)
    }

    /// Whether the engine is reached over the network.
    pub fn is_networked(&self) -> bool {
        !self.is_embedded()
    }

    /// Dialect facts for this engine.
    pub fn dialect(&self) -> Dialect {
        Dialect { engine: *self }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "embedded" | "file" => Ok(Engine::Sqlite),
            "postgres" | "postgresql" | "pgsql" | "pg" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "" => Err(Error::Config("engine name is empty".to_string())),
            other => Err(Error::Config(format!("unsupported engine: {}", other))),
        }
    }
}

/// Placeholder syntax used by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Positional `?`.
    Question,
    /// Numbered `$1`, `$2`, ...
    Dollar,
}

/// Upsert syntax supported by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertSyntax {
    /// `INSERT ... ON CONFLICT (...) DO UPDATE`.
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`.
    OnDuplicateKey,
}

/// Dialect facts for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    engine: Engine,
}

impl Dialect {
    /// The engine these facts describe.
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Native placeholder syntax.
    pub fn placeholder(&self) -> Placeholder {
        match self.engine {
            Engine::Postgres => Placeholder::Dollar,
            Engine::Sqlite | Engine::MySql => Placeholder::Question,
        }
    }

    /// Whether `INSERT/UPDATE ... RETURNING` is supported.
    pub fn supports_returning(&self) -> bool {
        matches!(self.engine, Engine::Sqlite | Engine::Postgres)
    }

    /// Upsert syntax for this engine.
    pub fn upsert_syntax(&self) -> UpsertSyntax {
        match self.engine {
            Engine::MySql => UpsertSyntax::OnDuplicateKey,
            Engine::Sqlite | Engine::Postgres => UpsertSyntax::OnConflict,
        }
    }

    /// Whether `SELECT ... FOR UPDATE` row locks are available.
    pub fn supports_row_locks(&self) -> bool {
        self.engine.is_networked()
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn param(&self, index: usize) -> String {
        match self.placeholder() {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${}", index),
        }
    }

    /// Quote an identifier for this engine.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self.engine {
            Engine::MySql => format!("`{}`", ident.replace('`', "``")),
            Engine::Sqlite | Engine::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Query counting tables named by the single parameter.
    pub fn table_exists_sql(&self) -> &'static str {
        match self.engine {
            Engine::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            Engine::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = ?"
            }
            Engine::MySql => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?"
            }
        }
    }

    /// Rewrite `?` placeholders into the engine's native syntax.
    ///
    /// Question marks inside quoted literals or identifiers are left alone.
    pub fn rebind<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if self.placeholder() == Placeholder::Question || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }

        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0;
        let mut quote: Option<char> = None;
        for ch in sql.chars() {
            match quote {
                Some(q) => {
                    if ch == q {
                        quote = None;
                    }
                    out.push(ch);
                }
                None => match ch {
                    '\'' | '"' | '`' => {
                        quote = Some(ch);
                        out.push(ch);
                    }
                    '?' => {
                        index += 1;
                        out.push('$');
                        out.push_str(&index.to_string());
                    }
                    _ => out.push(ch),
                },
            }
        }
        Cow::Owned(out)
    }
}
