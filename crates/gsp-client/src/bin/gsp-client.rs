//! GSP Client - Sit in a room as a member or launch it as the owner
//!
//! Usage:
//!   gsp-client --server 203.0.113.10:10000 --token 9f3c... wait
//!   gsp-client --server 203.0.113.10:10000 --token 9f3c... launch
//!
//! Rosters are normally fetched from the account layer; `--peer` seeds
//! one by hand.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gsp_client::{ClientEvent, RoomClient, RosterEntry};
use gsp_core::types::RoomToken;
use gsp_core::Config;

#[derive(Parser)]
#[command(name = "gsp-client")]
#[command(about = "GSP room member endpoint", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Room server main endpoint
    #[arg(short, long, env = "GSP_SERVER")]
    server: SocketAddr,

    /// Rendezvous token from the join, in hex
    #[arg(short, long, value_parser = parse_token)]
    token: RoomToken,

    /// Peer to ping, as name=ip:port (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<RosterEntry>,

    /// Config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay in the room until the owner launches
    Wait,
    /// Launch the room (owner only)
    Launch,
}

fn parse_token(s: &str) -> Result<RoomToken, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map(RoomToken)
        .map_err(|e| format!("invalid token: {}", e))
}

fn parse_peer(s: &str) -> Result<RosterEntry, String> {
    let (name, endpoint) = s
        .split_once('=')
        .ok_or_else(|| "expected name=ip:port".to_string())?;
    let endpoint: SocketAddr = endpoint
        .parse()
        .map_err(|e| format!("invalid endpoint {}: {}", endpoint, e))?;
    Ok(RosterEntry {
        name: name.to_string(),
        endpoint,
        can_relay: false,
        is_relay: false,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };

    let client = RoomClient::connect(cli.server, cli.token, config.client)
        .context("starting client endpoint")?;
    info!("Listening on {}", client.local_addr());

    if !cli.peers.is_empty() && !client.update_peers(cli.peers.clone()) {
        warn!("Client loop did not pick up the roster");
    }

    let result = match cli.command {
        Commands::Launch => {
            let host = client.request_launch().context("launching room")?;
            println!("{}", host);
            Ok(())
        }
        Commands::Wait => wait_for_launch(&client),
    };
    client.shutdown();
    result
}

fn wait_for_launch(client: &RoomClient) -> anyhow::Result<()> {
    let events = client.events();
    for event in events.iter() {
        match event {
            ClientEvent::Launched { host } => {
                println!("{}", host);
                return Ok(());
            }
            ClientEvent::ServerTimeout => bail!("room server {} stopped answering", client.server()),
            ClientEvent::RefreshRoster => {
                for peer in client.peers() {
                    info!(
                        "{} at {}: {:.0}% reachable, {:.1} ms",
                        peer.name,
                        peer.endpoint,
                        peer.connectivity * 100.0,
                        peer.average_rtt_ms
                    );
                }
            }
        }
    }
    bail!("client stopped")
}
