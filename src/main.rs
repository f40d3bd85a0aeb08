use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "provisiond")]
#[command(
    version,
    about = "Interactive credential-provisioning coordinator for login scripts"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = provisiond::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to listen on (overrides config and PROVISIOND_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,
        /// Development mode: permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default provisiond.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    provisiond::logging::init(cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&cli.config, *port, host.clone(), *dev).await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
