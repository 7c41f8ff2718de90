//! Spillway CLI - runs the streaming gateway.
//!
//! The gateway core is generic over the upstream transport; this binary
//! wires in the deterministic simulation backend, which is what local
//! development and the test suite run against. A production MTProto
//! connector plugs in through the same `UpstreamConnector` seam.

use std::sync::Arc;

use clap::Parser;
use spillway_core::GatewayError;
use spillway_core::config::GatewayConfig;
use spillway_core::pool::{BotCredential, WorkerPool};
use spillway_core::tracing_setup::{CliLogLevel, init_tracing};
use spillway_core::upstream::simulation::{SimulatedConnector, SimulatedUpstream};
use spillway_web::{AppState, run_server};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "spillway")]
#[command(about = "HTTP range-streaming gateway for channel-stored files")]
struct Cli {
    /// Console log level
    #[arg(long, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the gateway against the simulated upstream backend
    Serve {
        /// Size in bytes of the demo document behind message id 1
        #[arg(long, default_value_t = 3 * 1024 * 1024)]
        demo_file_size: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    match cli.command {
        Commands::Serve { demo_file_size } => serve(demo_file_size).await?,
    }
    Ok(())
}

async fn serve(demo_file_size: u64) -> Result<(), GatewayError> {
    let config = GatewayConfig::from_env()?;
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                shutdown.cancel();
            }
        });
    }

    let world = SimulatedUpstream::builder(config.upstream.channel_id)
        .document(1, demo_segment(demo_file_size))
        .build();
    let connector = SimulatedConnector::new(world);

    let credentials: Vec<BotCredential> = config
        .upstream
        .bot_tokens
        .iter()
        .map(BotCredential::new)
        .collect();
    let pool = Arc::new(WorkerPool::connect(&credentials, &connector, shutdown.clone()).await);
    info!(workers = pool.len(), "worker pool ready");

    let state = AppState::new(config, pool);
    run_server(state, shutdown).await?;
    Ok(())
}

/// Deterministic filler bytes for the demo document.
fn demo_segment(length: u64) -> Vec<u8> {
    (0..length).map(|i| (i % 256) as u8).collect()
}
