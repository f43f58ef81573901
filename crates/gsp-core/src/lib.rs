//! GSP Core - Wire protocol, shared types and UDP transport loops
//!
//! This crate contains the foundational pieces used by the room server, the
//! relay service and the client endpoint:
//!
//! - the fixed-layout datagram format ([`protocol`])
//! - room ids, rendezvous tokens and endpoint helpers ([`types`])
//! - the two UDP loop disciplines ([`transport`])
//! - TOML configuration ([`config`])

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, Config, ConfigError, RelayConfig, RoomConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Default UDP port of the main room server
pub const DEFAULT_MAIN_PORT: u16 = 10000;

/// Default UDP port of the auxiliary (NAT echo) room server
pub const DEFAULT_AUX_PORT: u16 = 10001;

/// Default UDP port of the relay service
pub const DEFAULT_RELAY_PORT: u16 = 10002;
