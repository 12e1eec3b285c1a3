mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use armada_bus::{DRAIN_INTERVAL, EventBus};
use armada_core::MemoryStore;
use armada_gateway::{GatewayState, register_reload_fanout, start_server};

use config::Config;

#[derive(Parser)]
#[command(name = "armada")]
#[command(about = "Armada — fleet software provisioning server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Armada gateway server
    Serve {
        /// Port to bind the server to
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            let addr: SocketAddr = format!("{}:{}", config.bind_address, port).parse()?;

            // The relational fleet store is an external collaborator; the
            // in-memory implementation backs a single-process deployment.
            let store = Arc::new(MemoryStore::new());
            let bus = Arc::new(EventBus::new());
            let state = GatewayState {
                bus: bus.clone(),
                store,
            };

            register_reload_fanout(&state);
            tokio::spawn(bus.run_drain_loop(DRAIN_INTERVAL));

            info!(addr = %addr, "starting Armada gateway");
            start_server(addr, state).await?;
        }
    }
    Ok(())
}
