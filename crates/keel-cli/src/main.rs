//! keel - operator tool for the keel control-plane store.
//!
//! Runs schema migrations, cluster nodes, and offline transfers of embedded
//! datasets onto networked engines.

mod commands;
mod config;
mod output;

use clap::Parser;

use config::Args;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = commands::run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
