mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "uptermd", about = "Secure terminal sharing server", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "uptermd.yaml", env = "UPTERMD_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Validate the configuration file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run => commands::run::command(&cli.config).await,
        Commands::Check => commands::check::command(&cli.config).await,
    }
}
