use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use armada_agent::{AgentClient, AgentConfig, AnsibleRunner, DEFAULT_RETRIES};

#[derive(Parser)]
#[command(name = "armada-agent")]
#[command(about = "Armada fleet agent — executes install commands from the central server")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "agent.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the agent configuration file
    Init {
        /// Hostname (and port) where the Armada server is reachable
        #[arg(long, default_value = "localhost:8080")]
        server_host: String,
        /// ID of the agent to connect as
        #[arg(long = "agent-id")]
        agent_id: Uuid,
        /// Overwrite an existing config file
        #[arg(short = 'f', long)]
        overwrite: bool,
        /// Connect without TLS
        #[arg(long)]
        insecure: bool,
    },
    /// Connect to the server and execute commands
    Run {
        /// Retry connecting forever instead of giving up after 5 attempts
        #[arg(short = 'r', long)]
        infinite_retries: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Init {
            server_host,
            agent_id,
            overwrite,
            insecure,
        } => {
            if cli.config.exists() && !overwrite {
                bail!(
                    "config file {} already exists (use --overwrite)",
                    cli.config.display()
                );
            }
            let config = AgentConfig::new(agent_id, server_host, !insecure);
            config.save(&cli.config).await?;
            info!(path = %cli.config.display(), "wrote agent config");
        }
        Commands::Run { infinite_retries } => {
            let config = AgentConfig::load(&cli.config).await?;
            let retries = if infinite_retries {
                None
            } else {
                Some(DEFAULT_RETRIES)
            };
            let runner = Arc::new(AnsibleRunner::new(config.http_base()));
            AgentClient::new(config, runner, retries).run().await?;
        }
    }
    Ok(())
}
