//! Subcommand handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use keel_cluster::{ClusterConfig, ClusterMode, Membership};
use keel_core::migration::builtin_migrator;
use keel_core::{Backend, BackendConfig, DatasetManager, MigrationStatus};
use keel_transfer::{backup_dataset, Transfer};

use crate::config::{Args, Command, NodeCommand};
use crate::output::{format_nodes, format_progress, format_report, format_status, OutputFormat};

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Run the parsed command line.
pub async fn run(args: Args) -> CliResult<()> {
    let config = args.into_config()?;
    let datasets = DatasetManager::new(config.datasets)?;
    info!(mode = %datasets.mode(), datasets = ?datasets.names(), "configuration loaded");

    let result = match args.command {
        Command::Migrate { dataset } => migrate(&datasets, dataset).await,
        Command::Rollback { dataset } => rollback(&datasets, &dataset).await,
        Command::Status => status(&datasets, args.format).await,
        Command::Node { command } => match command {
            NodeCommand::Run { .. } => run_node(&datasets, config.cluster).await,
            NodeCommand::List => list_nodes(&datasets, config.cluster, args.format).await,
            NodeCommand::Token => issue_token(&datasets, config.cluster).await,
        },
        Command::Transfer {
            dataset,
            to_engine,
            to_url,
            backup,
            backup_dir,
            progress_every,
        } => {
            let target = BackendConfig::new(to_engine).with_url(to_url);
            let backup_dir = backup.then_some(backup_dir);
            transfer(&datasets, &dataset, target, backup_dir, progress_every, args.format).await
        }
        Command::Backup { dataset, dir } => backup(&datasets, &dataset, dir).await,
    };

    datasets.close().await;
    result
}

/// Apply pending migrations to one dataset or all of them.
pub async fn migrate(datasets: &DatasetManager, dataset: Option<String>) -> CliResult<()> {
    let names = match dataset {
        Some(name) => vec![name],
        None => datasets.names().into_iter().map(String::from).collect(),
    };

    for name in names {
        let backend = datasets.dataset(&name)?;
        backend.connect().await?;

        let migrator = builtin_migrator(backend)?;
        let before = migrator.version().await?;
        let after = migrator.migrate().await?;
        if before == after {
            println!("{}: up to date at version {}", name, after);
        } else {
            println!("{}: migrated from version {} to {}", name, before, after);
        }
    }
    Ok(())
}

/// Revert the latest step of `dataset`.
pub async fn rollback(datasets: &DatasetManager, dataset: &str) -> CliResult<()> {
    let backend = datasets.dataset(dataset)?;
    backend.connect().await?;

    let migrator = builtin_migrator(backend)?;
    let before = migrator.version().await?;
    let after = migrator.rollback().await?;
    println!("{}: rolled back from version {} to {}", dataset, before, after);
    Ok(())
}

/// Collect the migration status of every dataset.
pub async fn collect_status(datasets: &DatasetManager) -> CliResult<Vec<MigrationStatus>> {
    datasets.open().await?;

    let mut statuses = Vec::new();
    for name in datasets.names() {
        let migrator = builtin_migrator(datasets.dataset(name)?)?;
        statuses.push(migrator.status().await?);
    }
    Ok(statuses)
}

async fn status(datasets: &DatasetManager, format: OutputFormat) -> CliResult<()> {
    let statuses = collect_status(datasets).await?;
    if format == OutputFormat::Table {
        println!("deployment mode: {}", datasets.mode());
    }
    println!("{}", format_status(&statuses, format));
    Ok(())
}

/// Join the cluster and hold membership until Ctrl-C.
async fn run_node(datasets: &DatasetManager, cluster: ClusterConfig) -> CliResult<()> {
    datasets.open().await?;
    migrate(datasets, None).await?;

    let membership = Membership::from_datasets(datasets, cluster.clone())?;
    membership.start().await?;
    info!(
        node_id = %membership.node_id(),
        mode = ?membership.mode(),
        primary = membership.is_primary(),
        "node running"
    );

    let mut ticker = tokio::time::interval(cluster.election_interval().max(Duration::from_secs(1)));
    let mut was_primary = membership.is_primary();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl+c");
                }
                info!("received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let primary = membership.is_primary();
                if primary != was_primary {
                    info!(node_id = %membership.node_id(), primary, "primary role changed");
                    was_primary = primary;
                }
            }
        }
    }

    if membership.mode() == ClusterMode::Standalone {
        membership.stop().await;
        return Ok(());
    }

    match membership.leave().await {
        Ok(()) => info!(node_id = %membership.node_id(), "left cluster"),
        Err(e) => {
            warn!(error = %e, "leave failed, stopping without hand-off");
            membership.stop().await;
        }
    }
    Ok(())
}

async fn list_nodes(
    datasets: &DatasetManager,
    cluster: ClusterConfig,
    format: OutputFormat,
) -> CliResult<()> {
    datasets.control()?.connect().await?;

    let membership = Membership::from_datasets(datasets, cluster)?;
    if membership.mode() == ClusterMode::Cluster {
        membership.store().ensure_schema().await?;
    }
    let nodes = membership.list_nodes().await?;
    println!("{}", format_nodes(&nodes, format));
    Ok(())
}

async fn issue_token(datasets: &DatasetManager, cluster: ClusterConfig) -> CliResult<()> {
    datasets.control()?.connect().await?;

    let membership = Membership::from_datasets(datasets, cluster)?;
    let token = membership.generate_join_token().await?;
    println!("{}", token.secret());
    println!("expires at {}", token.expires_at().to_rfc3339());
    Ok(())
}

/// Copy an embedded dataset onto a networked engine, optionally backing it
/// up first. `backup_dir` is `Some` when a backup was requested.
async fn transfer(
    datasets: &DatasetManager,
    dataset: &str,
    target: BackendConfig,
    backup_dir: Option<Option<PathBuf>>,
    progress_every: u64,
    format: OutputFormat,
) -> CliResult<()> {
    let source = datasets.dataset(dataset)?;
    source.connect().await?;

    if let Some(dir) = backup_dir {
        let path = backup_dataset(&source, dir).await?;
        println!("backup written to {}", path.display());
    }

    let target = Arc::new(Backend::open(format!("{}-target", dataset), target).await?);
    let transfer = Transfer::new(source, Arc::clone(&target))?.with_progress_interval(progress_every);

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", format_progress(&event));
        }
    });

    let result = transfer.run(Some(tx)).await;
    if let Err(e) = printer.await {
        warn!(error = %e, "progress printer failed");
    }
    target.close().await;

    let report = result?;
    println!("{}", format_report(&report, format));
    if !report.is_complete() {
        let failed: Vec<&str> = report.failed_tables().map(|t| t.table.as_str()).collect();
        return Err(format!("transfer incomplete, failed tables: {}", failed.join(", ")).into());
    }
    Ok(())
}

async fn backup(datasets: &DatasetManager, dataset: &str, dir: Option<PathBuf>) -> CliResult<()> {
    let backend = datasets.dataset(dataset)?;
    let path = backup_dataset(&backend, dir).await?;
    println!("backup written to {}", path.display());
    Ok(())
}
