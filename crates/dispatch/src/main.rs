//! alert-dispatch CLI - inspect configuration and replay trigger scenarios.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

/// Per-alert, per-alerter operation dispatch.
#[derive(Parser)]
#[command(name = "alert-dispatch")]
#[command(about = "Alert operation dispatch state machine")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Dispatch configuration (YAML); defaults plus environment if omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a trigger scenario against in-memory storage and print the outcome
    Replay {
        /// Scenario file (YAML)
        scenario: PathBuf,

        /// Dispatch configuration (YAML); defaults plus environment if omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Give up waiting for jobs after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,

        /// Print the final progress as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("dispatch=debug,alerter=debug,info")
        } else {
            EnvFilter::new("dispatch=info,alerter=info,warn")
        }
    });

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::CheckConfig { config } => cli::check::run(config.as_deref()),
        Commands::Replay {
            scenario,
            config,
            timeout,
            json,
        } => {
            tracing::info!(scenario = %scenario.display(), "Starting replay");
            cli::replay::run(&scenario, config.as_deref(), timeout, json).await
        }
    }
}
