//! fsw CLI - watch directory trees for changes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;
mod rescan;
mod system_config;

/// fsw - Native recursive file system watcher
#[derive(Parser)]
#[command(name = "fsw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch directories and print every change until Ctrl-C
    Watch {
        /// Directories to watch recursively
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Coalescing latency in milliseconds (0-60000)
        #[arg(long)]
        latency_ms: Option<u64>,
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// View and edit configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List all configuration values
    List,
    /// Get a single value (e.g. watch.latency_ms)
    Get {
        key: String,
    },
    /// Set a single value
    Set {
        key: String,
        value: String,
    },
    /// Show the config file path
    Path {
        /// Create the file with example contents if missing
        #[arg(long)]
        create: bool,
    },
    /// Print an example configuration
    Example,
}

fn init_tracing(cli_level: Option<&str>) -> Result<()> {
    let level = match cli_level {
        Some(level) => level.to_string(),
        // A broken config file is reported by the command itself
        None => system_config::load()
            .map(|config| config.log.level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    let level: tracing::Level = level
        .parse()
        .with_context(|| format!("Invalid log level '{}'", level))?;

    // Events go to stdout; keep logs on stderr
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Watch {
            roots,
            latency_ms,
            json,
        } => cmd::watch::run(roots, latency_ms, json).await,
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::List => cmd::config::run_list().await,
            ConfigCommands::Get { key } => cmd::config::run_get(&key).await,
            ConfigCommands::Set { key, value } => cmd::config::run_set(&key, &value).await,
            ConfigCommands::Path { create } => cmd::config::run_path(create).await,
            ConfigCommands::Example => cmd::config::run_example().await,
        },
    }
}
