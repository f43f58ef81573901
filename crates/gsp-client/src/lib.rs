//! GSP Client - Member endpoint for GSP rooms
//!
//! A member joins a room through the account layer and receives a
//! rendezvous token plus the room server endpoint. [`RoomClient`] then:
//!
//! - pings the room server so it learns (and keeps) our NAT mapping
//! - pings every roster peer directly and tracks loss and round trip
//! - runs the launch handshake, for the owner via
//!   [`RoomClient::request_launch`] and for everyone else by acknowledging
//!   the server's LaunchEvent
//!
//! Rosters themselves come from the account layer; the client asks for one
//! with [`ClientEvent::RefreshRoster`].

pub mod endpoint;
pub mod error;
pub mod events;
pub mod peer;

pub use endpoint::RoomClient;
pub use error::{ClientError, LaunchError};
pub use events::ClientEvent;
pub use peer::{Peer, PeerStats, PingTimings, RosterEntry};
