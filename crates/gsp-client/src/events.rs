//! Notifications from the endpoint loop to its owner

use std::net::SocketAddr;

/// Events queued by a [`RoomClient`](crate::RoomClient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The roster should be fetched again and handed to
    /// [`RoomClient::update_peers`](crate::RoomClient::update_peers)
    RefreshRoster,
    /// The room owner launched; connect to `host`
    Launched { host: SocketAddr },
    /// The room server stopped answering
    ServerTimeout,
}
