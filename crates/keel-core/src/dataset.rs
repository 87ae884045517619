//! Dataset manager.
//!
//! Binds each logical dataset to its own [`Backend`] and derives the
//! deployment topology from the engines involved.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{Backend, Engine};
use crate::config::{DatasetConfig, ACCOUNT_DATASET, CONTROL_DATASET};
use crate::error::{Error, Result};

/// Deployment topology derived from the engines of every dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Every dataset is embedded.
    Standalone,
    /// Every dataset uses the same networked engine.
    Cluster,
    /// Anything else.
    Mixed,
}

impl DeploymentMode {
    /// Derive the mode from the engines bound to each dataset.
    pub fn from_engines(engines: &[Engine]) -> Self {
        match engines.first() {
            None => DeploymentMode::Standalone,
            Some(first) => {
                if engines.iter().all(Engine::is_embedded) {
                    DeploymentMode::Standalone
                } else if first.is_networked() && engines.iter().all(|e| e == first) {
                    DeploymentMode::Cluster
                } else {
                    DeploymentMode::Mixed
                }
            }
        }
    }

    /// Label of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Standalone => "standalone",
            DeploymentMode::Cluster => "cluster",
            DeploymentMode::Mixed => "mixed",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns one backend per named dataset.
pub struct DatasetManager {
    datasets: Vec<(String, Arc<Backend>)>,
}

impl DatasetManager {
    /// Build the manager without connecting.
    ///
    /// Every configuration is validated up front so that configuration errors
    /// surface before any connection is opened.
    pub fn new(configs: Vec<DatasetConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("no datasets configured".to_string()));
        }

        let mut datasets: Vec<(String, Arc<Backend>)> = Vec::with_capacity(configs.len());
        for config in configs {
            if datasets.iter().any(|(name, _)| *name == config.name) {
                return Err(Error::Config(format!(
                    "dataset {} configured twice",
                    config.name
                )));
            }
            let backend = Backend::new(config.name.clone(), config.backend)
                .map_err(|e| match e {
                    Error::Config(msg) => Error::Config(format!("dataset {}: {}", config.name, msg)),
                    other => other,
                })?;
            datasets.push((config.name, Arc::new(backend)));
        }

        Ok(Self { datasets })
    }

    /// Build the manager and open every dataset.
    pub async fn connect(configs: Vec<DatasetConfig>) -> Result<Self> {
        let manager = Self::new(configs)?;
        manager.open().await?;
        Ok(manager)
    }

    /// Open every dataset in order.
    ///
    /// If any dataset fails to open, the ones opened before it are closed
    /// before the error is returned.
    pub async fn open(&self) -> Result<()> {
        for (index, (name, backend)) in self.datasets.iter().enumerate() {
            if let Err(e) = backend.connect().await {
                warn!(dataset = %name, error = %e, "dataset failed to open, closing opened datasets");
                for (_, opened) in &self.datasets[..index] {
                    opened.close().await;
                }
                return Err(e);
            }
        }

        info!(
            datasets = self.datasets.len(),
            mode = %self.mode(),
            "datasets opened"
        );
        Ok(())
    }

    /// Close every dataset. Idempotent.
    pub async fn close(&self) {
        for (_, backend) in &self.datasets {
            backend.close().await;
        }
    }

    /// Backend bound to `name`.
    pub fn dataset(&self, name: &str) -> Result<Arc<Backend>> {
        self.datasets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or_else(|| Error::UnknownDataset(name.to_string()))
    }

    /// Backend of the control dataset.
    pub fn control(&self) -> Result<Arc<Backend>> {
        self.dataset(CONTROL_DATASET)
    }

    /// Backend of the account dataset.
    pub fn account(&self) -> Result<Arc<Backend>> {
        self.dataset(ACCOUNT_DATASET)
    }

    /// Names of the configured datasets in configuration order.
    pub fn names(&self) -> Vec<&str> {
        self.datasets.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Whether every dataset is connected.
    pub fn is_ready(&self) -> bool {
        self.datasets.iter().all(|(_, backend)| backend.is_ready())
    }

    /// Whether datasets are bound to different engines.
    pub fn is_mixed(&self) -> bool {
        let engines = self.engines();
        engines.windows(2).any(|pair| pair[0] != pair[1])
    }

    /// Deployment mode label.
    pub fn mode(&self) -> DeploymentMode {
        DeploymentMode::from_engines(&self.engines())
    }

    fn engines(&self) -> Vec<Engine> {
        self.datasets
            .iter()
            .map(|(_, backend)| backend.engine())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_mode_from_engines() {
        use Engine::*;
        assert_eq!(DeploymentMode::from_engines(&[Sqlite, Sqlite]), DeploymentMode::Standalone);
        assert_eq!(DeploymentMode::from_engines(&[Postgres, Postgres]), DeploymentMode::Cluster);
        assert_eq!(DeploymentMode::from_engines(&[MySql, MySql]), DeploymentMode::Cluster);
        assert_eq!(DeploymentMode::from_engines(&[Postgres, Sqlite]), DeploymentMode::Mixed);
        assert_eq!(DeploymentMode::from_engines(&[Postgres, MySql]), DeploymentMode::Mixed);
        assert_eq!(DeploymentMode::Mixed.to_string(), "mixed");
    }

    #[test]
    fn test_mixed_topology_without_connecting() {
        let manager = DatasetManager::new(vec![
            DatasetConfig::control(BackendConfig::postgres("postgres://db/keel")),
            DatasetConfig::account(BackendConfig::sqlite("/tmp/keel-account.db")),
        ])
        .unwrap();

        assert_eq!(manager.mode(), DeploymentMode::Mixed);
        assert!(manager.is_mixed());
        assert!(!manager.is_ready());
        assert_eq!(manager.names(), vec!["control", "account"]);
    }

    #[test]
    fn test_configuration_errors() {
        let err = DatasetManager::new(vec![]).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let err = DatasetManager::new(vec![
            DatasetConfig::control(BackendConfig::sqlite("/tmp/a.db")),
            DatasetConfig::control(BackendConfig::sqlite("/tmp/b.db")),
        ])
        .err()
        .unwrap();
        assert!(err.to_string().contains("configured twice"));

        let err = DatasetManager::new(vec![DatasetConfig::account(BackendConfig::new("db2"))])
            .err()
            .unwrap();
        assert!(err.to_string().contains("dataset account"));
    }

    #[test]
    fn test_unknown_dataset() {
        let manager =
            DatasetManager::new(vec![DatasetConfig::control(BackendConfig::sqlite("/tmp/c.db"))])
                .unwrap();
        assert!(manager.control().is_ok());
        assert!(matches!(manager.account(), Err(Error::UnknownDataset(_))));
    }
}
