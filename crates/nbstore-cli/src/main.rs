//! nbstore CLI
//!
//! Command-line front end for nbstore: serves the store over stdio and
//! inspects space databases on disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nbstore_core::{StoreConfig, StoreRegistry, UniversalId};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "nbstore")]
#[command(about = "nbstore - Local-first storage for docs, blobs and sync clocks")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (overrides NBSTORE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve store commands as JSON lines over stdin/stdout
    Serve,
    /// Show the docs and blobs of a space
    Inspect {
        /// Universal id, e.g. "@peer(local);@type(workspace);@id(ws-1);"
        id: UniversalId,
    },
    /// Print the database path of a space
    Path {
        /// Universal id of the space
        id: UniversalId,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config_path = cli.config.clone().unwrap_or_else(StoreConfig::config_file_path);
    let config = StoreConfig::load_from_path(&config_path).context("Failed to load configuration")?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::Serve => {
            let registry = Arc::new(StoreRegistry::new(config));
            commands::serve::run(registry).await
        }
        Commands::Inspect { id } => commands::inspect::show(config, &id, &output).await,
        Commands::Path { id } => commands::inspect::path(&config, &id, &output),
        Commands::Config => commands::config::show(&config, &config_path, &output),
    }
}

/// Log to stderr; stdout is reserved for command output
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nbstore_core={},nbstore_cli={}",
            log_level, log_level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
