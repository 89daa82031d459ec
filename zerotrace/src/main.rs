mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "zerotrace", about = "Ephemeral copy-on-write execution spaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify configuration and host prerequisites. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Reclaim snapshots and mount points left behind by a crashed process.
    Sweep {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// List orphans without removing anything.
        #[arg(long)]
        dry_run: bool,
        /// Print OpenMetrics text after the sweep.
        #[arg(long)]
        metrics: bool,
    },
    /// Show managed snapshots and mount points present on the host.
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config)?;
        }
        Commands::Sweep {
            config: config_path,
            dry_run,
            metrics,
        } => {
            let config = cli::load_config(config_path)?;
            cli::run_sweep(&config, dry_run, metrics).await?;
        }
        Commands::Status {
            config: config_path,
            json,
        } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config, json).await?;
        }
    }

    Ok(())
}
