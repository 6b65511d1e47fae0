//! Command-line interface.

mod config_cmd;
mod icons;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tunegate")]
#[command(about = "Adaptive request orchestration for music metadata APIs")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults plus environment overrides when omitted)
    #[arg(short, long, global = true, env = "TUNEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Scans raw args for `-v` so logging can be set up before clap parses.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the orchestrator configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration
    Show {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Check the configuration and build every layer from it
    Validate,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show { json } => {
                config_cmd::cmd_config_show(cli.config.as_deref(), json).await
            }
            ConfigCommands::Validate => config_cmd::cmd_config_validate(cli.config.as_deref()).await,
        },
    }
}
