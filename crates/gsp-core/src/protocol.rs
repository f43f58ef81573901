//! Wire protocol definitions
//!
//! Every GSP datagram starts with the same 16-byte header. Some message
//! types append an IPv4 endpoint, giving a fixed 22-byte message:
//!
//! ```text
//! offset  size  field
//!      0     1  sentinel (0xF0)
//!      1     4  magic (0x46505347, little-endian)
//!      5     1  message type
//!      6     2  sequence id (little-endian)
//!      8     8  token (little-endian)
//!     16     4  IPv4 address (network order)
//!     20     2  port (little-endian)
//! ```
//!
//! Datagrams shorter than the header, or with a wrong sentinel or magic,
//! are not ours and get dropped without a reply.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::ProtocolError;
use crate::types::{ipv4_of, RoomToken};

/// First byte of every datagram
pub const SENTINEL: u8 = 0xF0;

/// Protocol magic ("GSPF" on the wire)
pub const MAGIC: u32 = 0x4650_5347;

/// Size of the common header
pub const HEADER_LEN: usize = 16;

/// Size of a header followed by an IPv4 endpoint
pub const MESSAGE_LEN: usize = HEADER_LEN + 6;

const OFF_MAGIC: usize = 1;
const OFF_TYPE: usize = 5;
const OFF_SEQ: usize = 6;
const OFF_TOKEN: usize = 8;
const OFF_ADDR: usize = 16;
const OFF_PORT: usize = 20;

/// Message types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Generic acknowledgment (Launch → owner, Ping → peer)
    Ack = 0x10,
    /// Server → peer: membership changed, re-fetch the roster. No payload.
    RoomEvent = 0x11,
    /// Peer → server: start the game. Owner only, answered with Ack.
    Launch = 0x12,
    /// Server → peer: game started, carries the host endpoint
    LaunchEvent = 0x13,
    /// Peer → server: LaunchEvent received
    LaunchEventAck = 0x14,
    /// Peer → server: report my observed endpoint
    SelfQuery = 0x15,
    /// Server → peer: your observed endpoint
    SelfReply = 0x16,
    /// Peer → peer: round-trip ping, answered with Ack
    Ping = 0x17,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x10 => MessageType::Ack,
            0x11 => MessageType::RoomEvent,
            0x12 => MessageType::Launch,
            0x13 => MessageType::LaunchEvent,
            0x14 => MessageType::LaunchEventAck,
            0x15 => MessageType::SelfQuery,
            0x16 => MessageType::SelfReply,
            0x17 => MessageType::Ping,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Check length, sentinel and magic without interpreting the rest
pub fn validate_frame(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::TooShort {
            len: bytes.len(),
            min: HEADER_LEN,
        });
    }
    if bytes[0] != SENTINEL {
        return Err(ProtocolError::BadSentinel(bytes[0]));
    }
    let magic = read_u32(bytes, OFF_MAGIC);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    Ok(())
}

/// Token of a valid frame, whatever its message type.
///
/// Used by the relay, which must not care about the message type.
pub fn frame_token(bytes: &[u8]) -> Result<RoomToken, ProtocolError> {
    validate_frame(bytes)?;
    Ok(RoomToken(read_u64(bytes, OFF_TOKEN)))
}

/// Common header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub seq: u16,
    pub token: RoomToken,
}

impl Header {
    pub fn new(msg_type: MessageType, seq: u16, token: RoomToken) -> Self {
        Self {
            msg_type,
            seq,
            token,
        }
    }

    /// Decode and validate a header
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        validate_frame(bytes)?;
        Ok(Self {
            msg_type: MessageType::try_from(bytes[OFF_TYPE])?,
            seq: read_u16(bytes, OFF_SEQ),
            token: RoomToken(read_u64(bytes, OFF_TOKEN)),
        })
    }

    /// Write the header into the first [`HEADER_LEN`] bytes of `out`
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0] = SENTINEL;
        out[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC.to_le_bytes());
        out[OFF_TYPE] = self.msg_type as u8;
        out[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_le_bytes());
        out[OFF_TOKEN..OFF_TOKEN + 8].copy_from_slice(&self.token.0.to_le_bytes());
    }

    /// Header-only datagram
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode_into(&mut out);
        out
    }
}

/// Header plus the optional IPv4 endpoint payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub endpoint: SocketAddrV4,
}

impl Packet {
    /// Packet carrying an endpoint. Fails for IPv6 endpoints, which the
    /// fixed layout cannot express.
    pub fn with_endpoint(header: Header, endpoint: SocketAddr) -> Result<Self, ProtocolError> {
        let ip = ipv4_of(endpoint.ip()).ok_or(ProtocolError::NotIpv4(endpoint))?;
        Ok(Self {
            header,
            endpoint: SocketAddrV4::new(ip, endpoint.port()),
        })
    }

    /// Decode a datagram. Header-only datagrams decode with an unspecified
    /// endpoint.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::decode(bytes)?;
        let endpoint = if bytes.len() >= MESSAGE_LEN {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[OFF_ADDR..OFF_ADDR + 4]);
            SocketAddrV4::new(Ipv4Addr::from(octets), read_u16(bytes, OFF_PORT))
        } else {
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        };
        Ok(Self { header, endpoint })
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_LEN] {
        let mut out = [0u8; MESSAGE_LEN];
        self.header.encode_into(&mut out);
        out[OFF_ADDR..OFF_ADDR + 4].copy_from_slice(&self.endpoint.ip().octets());
        out[OFF_PORT..OFF_PORT + 2].copy_from_slice(&self.endpoint.port().to_le_bytes());
        out
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}
