use std::path::PathBuf;

use anyhow::{Context, Result};
use camstream_core::CameraStreamConfig;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

use app::RegistryKind;

#[derive(Parser)]
#[command(name = "camstream")]
#[command(version)]
#[command(about = "Stream sampled camera frames to a peer discovered over mDNS")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advertise and stream frames to the first consumer that connects.
    Produce(RunArgs),
    /// Discover a producer, connect, and log the frames it sends.
    Consume(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON config file; `CAMSTREAM_*` variables override it.
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// `local` runs both ends in this process over loopback.
    #[arg(long, value_enum, default_value_t = RegistryKind::Mdns)]
    registry: RegistryKind,
}

impl RunArgs {
    fn load(&self) -> Result<CameraStreamConfig> {
        CameraStreamConfig::load(self.config.as_deref()).context("loading configuration")
    }
}

/// Load the config and run one subcommand.
async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Produce(args) => app::produce(args.load()?, args.registry).await,
        Commands::Consume(args) => app::consume(args.load()?, args.registry).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Usar RUST_LOG=debug para mais detalhes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!("CameraStream v{}", env!("CARGO_PKG_VERSION"));

    let result = run(cli.command).await;

    match result {
        Ok(()) => {
            info!("CameraStream exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
