//! Command-line arguments and the configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::output::OutputFormat;

use keel_cluster::ClusterConfig;
use keel_core::{BackendConfig, DatasetConfig};

/// Default directory for embedded dataset files.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the binary needs to open datasets and join a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Dataset bindings; the control and account datasets are required.
    pub datasets: Vec<DatasetConfig>,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl KeelConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// keel - control-plane store operator tool
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about = "Keel control-plane store", long_about = None)]
pub struct Args {
    /// JSON configuration file. Dataset flags are ignored when set.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding embedded dataset files.
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Engine of the control dataset (sqlite, postgres, mysql).
    #[arg(long, global = true, default_value = "sqlite")]
    pub control_engine: String,

    /// Connection URL of the control dataset for networked engines.
    #[arg(long, global = true)]
    pub control_url: Option<String>,

    /// Engine of the account dataset (sqlite, postgres, mysql).
    #[arg(long, global = true, default_value = "sqlite")]
    pub account_engine: String,

    /// Connection URL of the account dataset for networked engines.
    #[arg(long, global = true)]
    pub account_url: Option<String>,

    /// Maximum open connections per dataset.
    #[arg(long, global = true)]
    pub max_open_conns: Option<u32>,

    /// Output format for reports.
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations.
    Migrate {
        /// Only migrate this dataset.
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Revert the latest applied migration of a dataset.
    Rollback {
        #[arg(long)]
        dataset: String,
    },

    /// Show schema versions of every dataset.
    Status,

    /// Cluster membership.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Copy an embedded dataset onto a networked engine.
    Transfer {
        /// Dataset to copy; must be embedded.
        #[arg(long)]
        dataset: String,

        /// Target engine (postgres, mysql).
        #[arg(long)]
        to_engine: String,

        /// Target connection URL.
        #[arg(long)]
        to_url: String,

        /// Back up the dataset file first.
        #[arg(long)]
        backup: bool,

        /// Directory for the backup file. Defaults to next to the dataset.
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Rows between progress reports.
        #[arg(long, default_value_t = 1000)]
        progress_every: u64,
    },

    /// Back up an embedded dataset file.
    Backup {
        #[arg(long)]
        dataset: String,

        /// Directory for the backup file. Defaults to next to the dataset.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Join the cluster and run until Ctrl-C.
    Run {
        /// Hostname to advertise.
        #[arg(long)]
        hostname: Option<String>,

        /// Address to advertise.
        #[arg(long)]
        address: Option<String>,

        /// Port to advertise.
        #[arg(long, requires = "address")]
        port: Option<u16>,

        /// Heartbeat period in milliseconds.
        #[arg(long)]
        heartbeat_ms: Option<u64>,

        /// Election check period in milliseconds.
        #[arg(long)]
        election_ms: Option<u64>,
    },

    /// List known nodes.
    List,

    /// Issue a single-use join token.
    Token,
}

impl Args {
    /// Build the configuration from the file, or from dataset flags.
    pub fn into_config(&self) -> Result<KeelConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => KeelConfig::load(path)?,
            None => KeelConfig {
                datasets: vec![
                    DatasetConfig::control(self.backend(
                        &self.control_engine,
                        self.control_url.as_deref(),
                        keel_core::CONTROL_DATASET,
                    )),
                    DatasetConfig::account(self.backend(
                        &self.account_engine,
                        self.account_url.as_deref(),
                        keel_core::ACCOUNT_DATASET,
                    )),
                ],
                cluster: ClusterConfig::default(),
            },
        };

        if let Some(max) = self.max_open_conns {
            for dataset in &mut config.datasets {
                dataset.backend.max_open_conns = max;
            }
        }

        if let Command::Node {
            command:
                NodeCommand::Run {
                    hostname,
                    address,
                    port,
                    heartbeat_ms,
                    election_ms,
                },
        } = &self.command
        {
            let mut cluster = config.cluster;
            if let Some(hostname) = hostname {
                cluster = cluster.with_hostname(hostname);
            }
            if let Some(address) = address {
                cluster.address = Some(address.clone());
                cluster.port = *port;
            }
            if let Some(ms) = heartbeat_ms {
                cluster = cluster.with_heartbeat_interval(Duration::from_millis(*ms));
            }
            if let Some(ms) = election_ms {
                cluster = cluster.with_election_interval(Duration::from_millis(*ms));
            }
            config.cluster = cluster;
        }

        Ok(config)
    }

    fn backend(&self, engine: &str, url: Option<&str>, dataset: &str) -> BackendConfig {
        let backend = BackendConfig::new(engine);
        match url {
            Some(url) => backend.with_url(url),
            None => backend.with_path(self.data_dir.join(format!("{}.db", dataset))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_datasets_are_embedded() {
        let args = Args::try_parse_from(["keel", "status"]).unwrap();
        let config = args.into_config().unwrap();

        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.datasets[0].name, "control");
        assert_eq!(config.datasets[0].backend.engine, "sqlite");
        assert_eq!(
            config.datasets[0].backend.path,
            Some(PathBuf::from("./data/control.db"))
        );
        assert_eq!(
            config.datasets[1].backend.path,
            Some(PathBuf::from("./data/account.db"))
        );
    }

    #[test]
    fn test_networked_control_flags() {
        let args = Args::try_parse_from([
            "keel",
            "--control-engine",
            "postgres",
            "--control-url",
            "postgres://db/keel",
            "--max-open-conns",
            "4",
            "migrate",
            "--dataset",
            "control",
        ])
        .unwrap();
        let config = args.into_config().unwrap();

        let control = &config.datasets[0].backend;
        assert_eq!(control.engine, "postgres");
        assert_eq!(control.url.as_deref(), Some("postgres://db/keel"));
        assert_eq!(control.max_open_conns, 4);
        assert_eq!(config.datasets[1].backend.max_open_conns, 4);
        assert!(matches!(
            args.command,
            Command::Migrate { dataset: Some(ref d) } if d == "control"
        ));
    }

    #[test]
    fn test_node_run_overrides_cluster() {
        let args = Args::try_parse_from([
            "keel",
            "node",
            "run",
            "--hostname",
            "n1",
            "--address",
            "10.0.0.1",
            "--port",
            "7000",
            "--heartbeat-ms",
            "1000",
        ])
        .unwrap();
        let config = args.into_config().unwrap();

        assert_eq!(config.cluster.hostname, "n1");
        assert_eq!(config.cluster.address.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.cluster.port, Some(7000));
        assert_eq!(config.cluster.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_transfer_requires_target() {
        assert!(Args::try_parse_from(["keel", "transfer", "--dataset", "control"]).is_err());

        let args = Args::try_parse_from([
            "keel",
            "transfer",
            "--dataset",
            "control",
            "--to-engine",
            "postgres",
            "--to-url",
            "postgres://db/keel",
            "--backup",
        ])
        .unwrap();
        match args.command {
            Command::Transfer {
                backup,
                progress_every,
                ..
            } => {
                assert!(backup);
                assert_eq!(progress_every, 1000);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "datasets": [
                    {{"name": "control", "backend": {{"engine": "pgsql", "url": "postgres://db/keel"}}}},
                    {{"name": "account", "backend": {{"engine": "sqlite", "path": "/var/lib/keel/account.db"}}}}
                ],
                "cluster": {{"hostname": "edge-1", "heartbeat_interval_ms": 2000}}
            }}"#
        )
        .unwrap();

        let config = KeelConfig::load(file.path()).unwrap();
        assert_eq!(config.datasets[0].backend.engine, "pgsql");
        assert_eq!(config.cluster.hostname, "edge-1");
        assert_eq!(config.cluster.heartbeat_interval_ms, 2000);
        assert_eq!(config.cluster.stale_multiplier, 3);

        let err = KeelConfig::load(Path::new("/nonexistent/keel.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
