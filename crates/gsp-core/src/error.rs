//! Error types shared by every GSP component

use std::net::SocketAddr;

use thiserror::Error;

/// Datagram-level errors. Callers drop the datagram; nothing is sent back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram too short: {len} bytes (min {min})")]
    TooShort { len: usize, min: usize },

    #[error("bad sentinel byte: {0:#04x}")]
    BadSentinel(u8),

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    #[error("endpoint is not IPv4: {0}")]
    NotIpv4(SocketAddr),
}

/// Errors raised inside a transport loop iteration.
///
/// These never stop a loop; they are logged and the loop continues.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("task {task} failed: {reason}")]
    Task { task: &'static str, reason: String },
}
