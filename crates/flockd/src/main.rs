//! flockd — the Flock node daemon.
//!
//! # Usage
//!
//! ```text
//! flockd run --config flock.toml [--log-json]
//! flockd check-config --config flock.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flock_core::FlockConfig;
use flockd::Daemon;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,flockd=debug,flock=debug";

#[derive(Parser)]
#[command(name = "flockd", about = "Flock node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until Ctrl-C.
    Run {
        #[arg(long, default_value = "flock.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective values.
    CheckConfig {
        #[arg(long, default_value = "flock.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            run(config).await
        }
        Command::CheckConfig { config } => check_config(config),
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = FlockConfig::from_file(&path)?;
    info!(config = ?path, node = %config.node_name(), "configuration loaded");

    let mut daemon = Daemon::open(config)?;
    daemon.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    daemon.stop().await;
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = FlockConfig::from_file(&path)?;
    println!("# {} is valid", path.display());
    println!("node = {}", config.node_name());
    println!("data_dir = {}", config.data_dir().display());
    println!("default_node = {}", config.default_node());
    println!("heartbeat_interval = {:?}", config.heartbeat_interval());
    println!("ping_timeout = {:?}", config.ping_timeout());
    println!("poll_interval = {:?}", config.poll_interval());
    println!("confirm_threshold = {}", config.confirm_threshold());
    println!("history_retention = {:?}", config.history_retention());
    println!("default_rating = {}", config.default_rating());
    println!("action_poll_timeout = {:?}", config.action_poll_timeout());
    print!("{}", config.to_toml_string()?);
    Ok(())
}
