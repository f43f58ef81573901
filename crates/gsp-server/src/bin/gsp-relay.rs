//! GSP Relay
//!
//! Forwards datagrams between member pairs registered by the room server.
//!
//! # Usage
//!
//! ```bash
//! gsp-relay --port 10002 --public-address 203.0.113.10
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gsp_core::Config;
use gsp_server::RelayService;

#[derive(Parser, Debug)]
#[command(name = "gsp-relay")]
#[command(about = "GSP relay rendezvous service")]
#[command(version)]
struct Args {
    /// Config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Address members are told to send relay traffic to
    #[arg(long)]
    public_address: Option<IpAddr>,

    /// UDP port
    #[arg(short, long, env = "GSP_RELAY_PORT")]
    port: Option<u16>,

    /// Seconds of inactivity before a pairing is dropped
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

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
    let mut relay = config.relay;
    if let Some(bind) = args.bind {
        relay.bind = bind;
    }
    if let Some(public_address) = args.public_address {
        relay.public_address = public_address;
    }
    if let Some(port) = args.port {
        relay.port = port;
    }
    if let Some(timeout) = args.timeout {
        relay.client_timeout_secs = timeout;
    }

    info!("Starting GSP relay");
    let service = RelayService::start(&relay).context("starting relay")?;
    info!("Relay endpoint {}", service.public_endpoint());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.shutdown();
    Ok(())
}
