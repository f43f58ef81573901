//! Core type definitions for GSP
//!
//! Room ids, rendezvous tokens and the endpoint comparison rules used by
//! every component. All comparisons treat IPv4-mapped IPv6 addresses as
//! their IPv4 counterpart, because sockets bound on dual-stack hosts report
//! either form for the same peer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Token value used by server-originated broadcasts, which are not
/// addressed to a single membership.
pub const NO_TOKEN: u64 = u64::MAX;

/// Unique room identifier. Rendered as 16 upper-case hex digits.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({:016X})", self.0)
    }
}

impl FromStr for RoomId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(RoomId)
    }
}

/// Per-membership UDP session key.
///
/// Distinct from the HTTP identity: a new token is minted on every join.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoomToken(pub u64);

impl RoomToken {
    /// The broadcast sentinel
    pub const NONE: RoomToken = RoomToken(NO_TOKEN);

    pub const fn is_none(self) -> bool {
        self.0 == NO_TOKEN
    }
}

impl fmt::Display for RoomToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for RoomToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomToken({:016X})", self.0)
    }
}

/// Generator of room ids and rendezvous tokens.
///
/// Values are a keyed transform of a monotonically increasing counter. Both
/// multipliers are odd, so the transform is a bijection on `u64` and a value
/// is never produced twice for the lifetime of the mint. The keys hide the
/// counter from clients.
pub struct TokenMint {
    counter: AtomicU64,
    keys: [u64; 3],
}

impl TokenMint {
    /// Create a mint with random keys
    pub fn new() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 24];
        getrandom::fill(&mut bytes)?;
        let mut keys = [0u64; 3];
        for (key, chunk) in keys.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *key = u64::from_le_bytes(word);
        }
        Ok(Self::with_keys(keys))
    }

    /// Create a mint with fixed keys (tests, benchmarks)
    pub fn with_keys(keys: [u64; 3]) -> Self {
        Self {
            counter: AtomicU64::new(0),
            keys: [keys[0], keys[1] | 1, keys[2] | 1],
        }
    }

    fn transform(&self, t: u64) -> u64 {
        let t = t.wrapping_add(self.keys[0]).wrapping_mul(self.keys[1]);
        t.wrapping_add(self.keys[1]).wrapping_mul(self.keys[2])
    }

    /// Next unique value, never [`NO_TOKEN`]
    pub fn next(&self) -> u64 {
        loop {
            let t = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            let v = self.transform(t);
            if v != NO_TOKEN {
                return v;
            }
        }
    }

    pub fn next_room_id(&self) -> RoomId {
        RoomId(self.next())
    }

    pub fn next_token(&self) -> RoomToken {
        RoomToken(self.next())
    }
}

/// IPv4 view of an address, unwrapping IPv4-mapped IPv6 addresses
pub fn ipv4_of(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Normalize an endpoint so IPv4-mapped IPv6 endpoints compare and hash as IPv4
pub fn normalize(ep: SocketAddr) -> SocketAddr {
    match ipv4_of(ep.ip()) {
        Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, ep.port())),
        None => ep,
    }
}

/// Same address, ignoring the port
pub fn same_address(a: IpAddr, b: IpAddr) -> bool {
    match (ipv4_of(a), ipv4_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Same address and port
pub fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && same_address(a.ip(), b.ip())
}
