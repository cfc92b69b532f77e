pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::utils::default_log_file;
use config::QueueConfig;

/// Maintenance tools for a store-backed crawl queue
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, the default configuration when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file, the platform data directory when no path is given
    #[arg(long, global = true, value_name = "PATH", num_args = 0..=1, require_equals = true)]
    log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// File to mirror logs into, if any
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(default_log_file))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Drop the queue and statistics collections
    Drop,

    /// Requeue abandoned items until the queue is fully fetched
    Gc {
        /// Consecutive fully-fetched ticks before exiting
        #[arg(long, default_value_t = 15)]
        idle_ticks: u32,
    },

    /// Record statistics snapshots until the queue is fully fetched
    Monitor {
        /// Consecutive fully-fetched snapshots before exiting
        #[arg(long, default_value_t = 15)]
        idle_ticks: u32,
    },

    /// Print current queue statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

fn load_config(path: Option<&PathBuf>) -> Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::load_from_file(path),
        None => QueueConfig::load_default(),
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Drop => {
            info!("Dropping queue collections");
            commands::drop_collections(&config).await
        }
        Commands::Gc { idle_ticks } => {
            info!("Running garbage collector until idle for {} ticks", idle_ticks);
            commands::run_gc(&config, idle_ticks).await
        }
        Commands::Monitor { idle_ticks } => {
            info!("Running monitor until idle for {} snapshots", idle_ticks);
            commands::run_monitor(&config, idle_ticks).await
        }
        Commands::Stats { json } => commands::show_stats(&config, json).await,
        Commands::Config => commands::show_config(&config),
    }
}
