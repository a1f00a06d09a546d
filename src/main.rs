//! skylark - authoritative replication host for a tile-chunked sandbox
//!
//! Headless executable: in-process loopback simulation, QUIC server and QUIC client.

mod config;
mod headless;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::SkylarkConfig;
use headless::HeadlessConfig;
use skylark_client::MultiplayerClient;
use skylark_core::{ChunkPos, PeerId, Vec2};
use skylark_server::MultiplayerServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Authoritative replication host for skylark worlds",
    long_about = None
)]
struct Args {
    /// Configuration file (defaults to config/skylark.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server and simulated clients in-process over the loopback transport
    Loopback {
        /// Number of simulated players
        #[arg(long, default_value_t = 2)]
        clients: usize,
        /// Number of ticks to simulate
        #[arg(long, default_value_t = 500)]
        frames: usize,
    },
    /// Serve the world over QUIC until interrupted
    Serve {
        /// Listen address (overrides the config file)
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Connect a headless player to a QUIC server
    Connect {
        /// Server address
        addr: SocketAddr,
        /// Peer id to present (must be non-zero and unique on the server)
        #[arg(long, default_value_t = 1)]
        id: u64,
        /// Display name
        #[arg(long, default_value = "player")]
        name: String,
        /// Number of ticks to run before disconnecting
        #[arg(long, default_value_t = 1000)]
        frames: usize,
    },
}

fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting skylark v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SkylarkConfig::load_from_path(path),
        None => SkylarkConfig::load(),
    };

    match args.command.unwrap_or(Command::Loopback {
        clients: 2,
        frames: 500,
    }) {
        Command::Loopback { clients, frames } => {
            let report = headless::run(HeadlessConfig {
                settings: config.server.clone(),
                tick: config.tick(),
                clients,
                frames,
            })?;
            info!(?report, "Loopback report");
            Ok(())
        }
        Command::Serve { addr } => {
            let addr = addr.unwrap_or(config.listen_addr);
            runtime()?.block_on(serve(&config, addr))
        }
        Command::Connect {
            addr,
            id,
            name,
            frames,
        } => runtime()?.block_on(connect(&config, addr, PeerId(id), &name, frames)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

async fn serve(config: &SkylarkConfig, addr: SocketAddr) -> Result<()> {
    let mut server = MultiplayerServer::bind(addr, config.server.clone())?;
    let mut interval = tokio::time::interval(config.tick());
    let tick = config.tick();

    loop {
        tokio::select! {
            _ = interval.tick() => server.update(tick)?,
            _ = tokio::signal::ctrl_c() => {
                info!(ticks = server.current_tick(), "Shutting down server");
                return Ok(());
            }
        }
    }
}

async fn connect(
    config: &SkylarkConfig,
    addr: SocketAddr,
    identity: PeerId,
    name: &str,
    frames: usize,
) -> Result<()> {
    let mut client =
        MultiplayerClient::connect(addr, identity, name, config.server.replication.clone()).await?;
    let mut interval = tokio::time::interval(config.tick());
    let tick = config.tick();
    let mut subscribed = false;
    let mut was_connected = false;

    for frame in 0..frames {
        interval.tick().await;
        client.update(tick)?;

        if client.is_connected() {
            was_connected = true;
            if !subscribed {
                client.request_chunk(ChunkPos::new(0, 0))?;
                subscribed = true;
            }
            let angle = frame as f32 * 0.02;
            client.move_player(Vec2::new(angle.cos(), angle.sin()) * 6.0);
        } else if was_connected {
            warn!("Server closed the connection");
            return Ok(());
        }
    }

    info!(
        entities = client.world().replication().len(),
        chunks = client.world().cached_chunks(),
        "Disconnecting"
    );
    client.disconnect();
    Ok(())
}
