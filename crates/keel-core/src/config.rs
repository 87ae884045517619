//! Backend and dataset configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Engine;
use crate::error::{Error, Result};

/// Default maximum open connections per pool.
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 10;

/// Default number of idle connections kept warm.
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 2;

/// Default maximum connection lifetime in seconds (30 minutes).
pub const DEFAULT_CONN_MAX_LIFETIME_SECS: u64 = 1800;

/// Default timeout for acquiring a pooled connection in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Name of the control-plane dataset.
pub const CONTROL_DATASET: &str = "control";

/// Name of the account dataset.
pub const ACCOUNT_DATASET: &str = "account";

/// Configuration for one backend connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Engine name or alias (e.g. "sqlite", "postgres", "pgsql", "mysql").
    pub engine: String,

    /// Database file path for embedded engines.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Connection URL for networked engines.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of open connections.
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,

    /// Idle connections kept warm by the pool.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,

    /// Maximum lifetime of a pooled connection in seconds. Zero disables recycling.
    #[serde(default = "default_conn_max_lifetime_secs")]
    pub conn_max_lifetime_secs: u64,

    /// Timeout for acquiring a pooled connection in seconds.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_open_conns() -> u32 {
    DEFAULT_MAX_OPEN_CONNS
}

fn default_max_idle_conns() -> u32 {
    DEFAULT_MAX_IDLE_CONNS
}

fn default_conn_max_lifetime_secs() -> u64 {
    DEFAULT_CONN_MAX_LIFETIME_SECS
}

fn default_acquire_timeout_secs() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

impl BackendConfig {
    /// Create a configuration for the given engine with no descriptor.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            path: None,
            url: None,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            conn_max_lifetime_secs: DEFAULT_CONN_MAX_LIFETIME_SECS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
        }
    }

    /// Create an embedded SQLite configuration.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::new("sqlite").with_path(path)
    }

    /// Create a PostgreSQL configuration.
    pub fn postgres(url: impl Into<String>) -> Self {
        Self::new("postgres").with_url(url)
    }

    /// Create a MySQL configuration.
    pub fn mysql(url: impl Into<String>) -> Self {
        Self::new("mysql").with_url(url)
    }

    /// Set the database file path.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the connection URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the maximum number of open connections.
    pub fn with_max_open_conns(mut self, max: u32) -> Self {
        self.max_open_conns = max.max(1);
        self
    }

    /// Set the number of idle connections kept warm.
    pub fn with_max_idle_conns(mut self, idle: u32) -> Self {
        self.max_idle_conns = idle;
        self
    }

    /// Set the maximum connection lifetime.
    pub fn with_conn_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.conn_max_lifetime_secs = lifetime.as_secs();
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Resolve the engine name, normalizing aliases.
    pub fn resolve_engine(&self) -> Result<Engine> {
        self.engine.parse()
    }

    /// Build the connection URL understood by the driver.
    ///
    /// Fails when the descriptor required by the engine is missing.
    pub fn connection_url(&self) -> Result<String> {
        let engine = self.resolve_engine()?;
        match engine {
            Engine::Sqlite => {
                let path = self.path.as_ref().ok_or_else(|| {
                    Error::Config("sqlite backend requires a database path".to_string())
                })?;
                if path.as_os_str().is_empty() {
                    return Err(Error::Config(
                        "sqlite backend requires a database path".to_string(),
                    ));
                }
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            Engine::Postgres | Engine::MySql => {
                let url = self
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        Error::Config(format!("{} backend requires a connection url", engine))
                    })?;
                Ok(url.to_string())
            }
        }
    }

    /// Validate the configuration without connecting.
    pub fn validate(&self) -> Result<()> {
        self.connection_url().map(|_| ())
    }

    /// Maximum connection lifetime, `None` when recycling is disabled.
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        match self.conn_max_lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Acquire timeout as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }
}

/// A named dataset bound to one backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Logical dataset name (e.g. "control").
    pub name: String,
    /// Backend binding.
    pub backend: BackendConfig,
}

impl DatasetConfig {
    /// Create a new dataset binding.
    pub fn new(name: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// Binding for the control dataset.
    pub fn control(backend: BackendConfig) -> Self {
        Self::new(CONTROL_DATASET, backend)
    }

    /// Binding for the account dataset.
    pub fn account(backend: BackendConfig) -> Self {
        Self::new(ACCOUNT_DATASET, backend)
    }
}
