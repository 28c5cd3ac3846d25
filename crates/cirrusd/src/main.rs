//! cirrusd: the Cirrus controller daemon.
//!
//! Opens the redb state store, seeds workload templates and warms the
//! datastore cache, then serves until interrupted.
//!
//! # Usage
//!
//! ```text
//! cirrusd run --config /etc/cirrus/cirrusd.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use cirrus_datastore::Datastore;
use cirrus_state::StateStore;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "cirrusd", about = "Cirrus controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller datastore until interrupted.
    Run {
        /// Path to the daemon config file.
        #[arg(long, default_value = "/etc/cirrus/cirrusd.toml")]
        config: PathBuf,

        /// Override `data_dir` from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cirrusd=debug,cirrus=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let mut config = Config::from_file(&config)?;
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            run(config).await
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(data_dir = ?config.data_dir, "cirrus controller starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("cirrus.redb");
    let store = Arc::new(StateStore::open(&db_path)?);
    info!(path = ?db_path, "state store opened");

    if let Some(path) = &config.workloads_path {
        crate::config::seed_workloads(store.as_ref(), path)?;
    }

    let datastore = Datastore::init(store, config.datastore());
    let tenants = datastore.get_all_tenants().await?.len();
    let instances = datastore.get_all_instances().await.len();
    info!(tenants, instances, "datastore ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    datastore.exit().await;
    info!("cirrus controller stopped");
    Ok(())
}
