//! Geyser Monitor - streams, filters, stores and alerts on Solana transactions

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use geyser_monitor::cli::commands;
use geyser_monitor::config::ConfigHandle;

/// Geyser Monitor - transaction ingestion and alerting
#[derive(Parser)]
#[command(name = "monitor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start ingesting from every configured source
    Start,

    /// Show current configuration (secrets masked)
    Config,

    /// Look up a stored transaction by signature
    Get {
        /// Base58 transaction signature
        signature: String,
    },

    /// Back up the transaction store
    Backup {
        /// Backup directory
        dir: PathBuf,
    },

    /// Compact the transaction store
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let handle = ConfigHandle::load(&cli.config);
    let log_level = handle
        .as_ref()
        .map(|h| h.current().log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&log_level);

    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    let config = handle.current();

    let result = match cli.command {
        Commands::Start => commands::start(handle).await,
        Commands::Config => commands::show_config(&config),
        Commands::Get { signature } => commands::get(&config, &signature).await,
        Commands::Backup { dir } => commands::backup(&config, &dir).await,
        Commands::Compact => commands::compact(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
