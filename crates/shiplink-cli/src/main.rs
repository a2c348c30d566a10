//! Shiplink CLI - Command-line interface for the shiplink resilience layer
//!
//! Provides commands for:
//! - Bulk downloading items from the REST backend under the adaptive limiter
//! - Viewing and validating the configuration file

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shiplink_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{config::ConfigCommand, download::DownloadCommand};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "shiplink",
    version,
    about = "Resilient bulk access to the shiplink REST and SOAP services"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download items in bulk
    Download(DownloadCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Global options every command receives
#[derive(Debug, Clone)]
pub struct Context {
    pub format: OutputFormat,
    pub quiet: bool,
    pub config_path: PathBuf,
}

/// Level used when `RUST_LOG` is unset: `-q` wins, then `-v`, then the
/// configured `logging.level`.
fn log_level(cli: &Cli, configured: &str) -> String {
    if cli.quiet {
        return "warn".to_string();
    }
    match cli.verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let configured_level = Config::load_or_default(&config_path).logging.level;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(&cli, &configured_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context {
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        },
        quiet: cli.quiet,
        config_path,
    };

    match cli.command {
        Commands::Download(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    }
}
