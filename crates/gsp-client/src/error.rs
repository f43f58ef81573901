//! Client errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server address {0} is not IPv4")]
    NotIpv4(std::net::SocketAddr),
}

/// Why a launch request did not produce a host endpoint
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    #[error("launch timed out waiting for the room server")]
    TimedOut,

    #[error("client stopped")]
    Stopped,
}
