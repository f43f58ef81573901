//! GSP Room Server
//!
//! Runs the main and aux room ports around an in-memory room directory.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (main 10000, aux 10001)
//! gsp-room-server
//!
//! # Explicit config file, four worker threads
//! gsp-room-server --config /etc/gsp/config.toml --threads 4
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gsp_core::Config;
use gsp_server::RoomService;

#[derive(Parser, Debug)]
#[command(name = "gsp-room-server")]
#[command(about = "GSP room server (NAT echo, launch handshake, roster pokes)")]
#[command(version)]
struct Args {
    /// Config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Address advertised to members as the UDP server
    #[arg(long)]
    public_address: Option<String>,

    /// Main port
    #[arg(short, long, env = "GSP_MAIN_PORT")]
    port: Option<u16>,

    /// Aux (NAT echo) port
    #[arg(long)]
    aux_port: Option<u16>,

    /// Worker threads on the main port
    #[arg(short, long)]
    threads: Option<usize>,

    /// Print a sample config and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::sample());
        return Ok(());
    }

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };
    let mut room = config.room;
    if let Some(bind) = args.bind {
        room.bind = bind;
    }
    if let Some(public_address) = args.public_address {
        room.public_address = public_address;
    }
    if let Some(port) = args.port {
        room.main_port = port;
    }
    if let Some(aux_port) = args.aux_port {
        room.aux_port = aux_port;
    }
    if let Some(threads) = args.threads {
        room.threads = threads;
    }

    info!("Starting GSP room server");
    info!("Advertising {} to members", room.public_endpoint());

    let service = RoomService::start(room).context("starting room service")?;
    info!(
        "Main port {}, aux port {}",
        service.main_addr(),
        service.aux_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.shutdown();
    Ok(())
}
