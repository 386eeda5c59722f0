use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "evolver")]
#[command(version, about = "Asset evolution lifecycle orchestrator")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "evolver.toml", env = "EVOLVER_CONFIG")]
    pub config: PathBuf,

    /// Emit logs (and command output) as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the lifecycle: monitor, execute, distribute, repeat
    Run,
    /// Show the persisted cycle state
    Status,
    /// Clear an interrupted execution and return to casual monitoring
    Recover,
    /// View, validate or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (file plus environment)
    Show,
    /// Validate the configuration and list any problems
    Validate,
    /// Write a default evolver.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evolver=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json);

    match &cli.command {
        Commands::Run => cmd::cmd_run(&cli.config).await?,
        Commands::Status => cmd::cmd_status(&cli.config, cli.json).await?,
        Commands::Recover => cmd::cmd_recover(&cli.config, cli.json).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
