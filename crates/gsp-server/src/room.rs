//! Room state
//!
//! A [`Room`] pairs its immutable public info with a [`RoomState`] behind a
//! per-room mutex. Every state transition is a single `RoomState` method
//! called with the lock held once. Methods return what the caller has to do
//! afterwards (token table cleanup, room removal, broadcasts) so that work
//! runs after the lock is released.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use gsp_core::types::{normalize, same_address, RoomId, RoomToken};

/// Verified caller identity, supplied by the account layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable account key (the HTTP identity token)
    pub id: String,
    /// Display name
    pub name: String,
    pub may_create_room: bool,
    pub may_use_room: bool,
    pub may_relay: bool,
}

impl Identity {
    /// Identity with every capability (tests, local tools)
    pub fn full(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            may_create_room: true,
            may_use_room: true,
            may_relay: true,
        }
    }
}

/// Display-only room fields
#[derive(Debug, Clone, Default)]
pub struct RoomDescription {
    pub name: String,
    pub description: String,
    pub image: String,
}

/// One membership
#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub identity: String,
    pub name: String,
    /// Port 0 until the first UDP datagram confirms it
    pub endpoint: SocketAddr,
    pub last_active: Instant,
}

impl Member {
    pub fn is_confirmed(&self) -> bool {
        self.endpoint.port() != 0
    }
}

/// Roster entry as seen by one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    /// Where to reach the member: its own endpoint, or the relay
    pub endpoint: SocketAddr,
    /// Caller may ask for a relay towards this member
    pub can_relay: bool,
    /// `endpoint` is a relay
    pub is_relay: bool,
}

/// Status of one identity in one room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStatus {
    pub joined: bool,
    pub host: bool,
    pub max_peers: usize,
    pub peers: usize,
}

/// Public listing entry
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub owner_name: String,
    pub image: String,
    pub status: UserStatus,
    pub can_join: bool,
    pub can_launch: bool,
}

/// A member to notify on launch, with the host endpoint it must use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTarget {
    pub token: RoomToken,
    pub endpoint: SocketAddr,
    pub host: SocketAddr,
    pub is_owner: bool,
}

/// Result of [`RoomState::confirm`]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Confirm {
    /// Known endpoint, activity refreshed
    Refreshed,
    /// First datagram: port learned, everyone else gets a RoomEvent
    Confirmed { notify: Vec<SocketAddr> },
    /// Unknown token or endpoint mismatch
    Rejected,
}

/// A membership removed from a room
#[derive(Debug)]
pub(crate) struct Departure {
    pub token: RoomToken,
    pub identity: String,
    pub was_owner: bool,
    pub notify: Vec<SocketAddr>,
    pub room_empty: bool,
}

/// Memberships dropped when a room closes
#[derive(Debug, Default)]
pub(crate) struct Closure {
    pub tokens: Vec<RoomToken>,
    pub identities: Vec<String>,
}

/// Unordered endpoint pair
fn route_key(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    let (a, b) = (normalize(a), normalize(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Mutable part of a room, guarded by the room lock
#[derive(Debug, Default)]
pub struct RoomState {
    members: HashMap<RoomToken, Member>,
    tokens: HashMap<String, RoomToken>,
    owner_token: Option<RoomToken>,
    owner_endpoint: Option<SocketAddr>,
    relays: HashMap<(SocketAddr, SocketAddr), SocketAddr>,
    closed: bool,
}

impl RoomState {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn owner_endpoint(&self) -> Option<SocketAddr> {
        self.owner_endpoint
    }

    pub fn token_of(&self, identity: &str) -> Option<RoomToken> {
        self.tokens.get(identity).copied()
    }

    pub(crate) fn member(&self, token: RoomToken) -> Option<&Member> {
        self.members.get(&token)
    }

    pub(crate) fn confirmed_endpoints(&self) -> Vec<SocketAddr> {
        self.members
            .values()
            .filter(|m| m.is_confirmed())
            .map(|m| m.endpoint)
            .collect()
    }

    pub(crate) fn add_member(
        &mut self,
        token: RoomToken,
        identity: &str,
        name: &str,
        address: IpAddr,
        is_host: bool,
        now: Instant,
    ) -> Vec<SocketAddr> {
        self.members.insert(
            token,
            Member {
                identity: identity.to_string(),
                name: name.to_string(),
                endpoint: normalize(SocketAddr::new(address, 0)),
                last_active: now,
            },
        );
        self.tokens.insert(identity.to_string(), token);
        if is_host {
            self.owner_token = Some(token);
        }
        self.confirmed_endpoints()
    }

    /// Match a datagram source against a membership.
    ///
    /// The address recorded at join time comes from the HTTP path; when the
    /// first UDP datagram arrives from a different address, the UDP one
    /// wins. After that, address and port must match exactly.
    pub(crate) fn confirm(&mut self, token: RoomToken, observed: SocketAddr, now: Instant) -> Confirm {
        let observed = normalize(observed);
        let Some(member) = self.members.get_mut(&token) else {
            return Confirm::Rejected;
        };

        if !member.is_confirmed() && !same_address(member.endpoint.ip(), observed.ip()) {
            member.endpoint = SocketAddr::new(observed.ip(), 0);
        }
        if !same_address(member.endpoint.ip(), observed.ip()) {
            return Confirm::Rejected;
        }

        if member.endpoint.port() == observed.port() {
            member.last_active = now;
            return Confirm::Refreshed;
        }
        if member.is_confirmed() {
            return Confirm::Rejected;
        }

        member.endpoint = observed;
        member.last_active = now;
        if self.owner_token == Some(token) {
            self.owner_endpoint = Some(observed);
        }
        Confirm::Confirmed {
            notify: self.confirmed_endpoints(),
        }
    }

    /// Remove a membership and the relay routes touching it
    pub(crate) fn remove(&mut self, token: RoomToken) -> Option<Departure> {
        let member = self.members.remove(&token)?;
        self.tokens.remove(&member.identity);

        if member.is_confirmed() {
            let gone = member.endpoint;
            self.relays.retain(|(a, b), _| *a != gone && *b != gone);
        }

        let was_owner = self.owner_token == Some(token);
        Some(Departure {
            token,
            identity: member.identity,
            was_owner,
            notify: self.confirmed_endpoints(),
            room_empty: self.members.is_empty(),
        })
    }

    /// Close the room and drop every membership
    pub(crate) fn close(&mut self) -> Closure {
        self.closed = true;
        self.relays.clear();
        self.tokens.clear();
        let mut closure = Closure::default();
        for (token, member) in self.members.drain() {
            closure.tokens.push(token);
            closure.identities.push(member.identity);
        }
        closure
    }

    /// Tokens whose last activity is older than `deadline`
    pub(crate) fn idle_since(&self, deadline: Instant) -> Vec<RoomToken> {
        self.members
            .iter()
            .filter(|(_, m)| m.last_active < deadline)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Confirmed member owning `endpoint`
    pub(crate) fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<(RoomToken, &Member)> {
        let endpoint = normalize(endpoint);
        self.members
            .iter()
            .find(|(_, m)| m.is_confirmed() && m.endpoint == endpoint)
            .map(|(t, m)| (*t, m))
    }

    pub(crate) fn set_route(&mut self, a: SocketAddr, b: SocketAddr, relay: SocketAddr) {
        self.relays.insert(route_key(a, b), normalize(relay));
    }

    pub fn route(&self, a: SocketAddr, b: SocketAddr) -> Option<SocketAddr> {
        self.relays.get(&route_key(a, b)).copied()
    }

    pub fn route_count(&self) -> usize {
        self.relays.len()
    }

    /// Roster for `identity`: confirmed members except itself, with relay
    /// endpoints substituted. Empty while the caller is unconfirmed.
    pub(crate) fn roster_for(&self, identity: &str, may_relay: bool) -> Vec<MemberInfo> {
        let Some(me) = self.token_of(identity).and_then(|t| self.members.get(&t)) else {
            return Vec::new();
        };
        if !me.is_confirmed() {
            return Vec::new();
        }

        self.members
            .values()
            .filter(|m| m.is_confirmed() && m.identity != identity)
            .map(|m| {
                let relay = self.route(me.endpoint, m.endpoint);
                MemberInfo {
                    name: m.name.clone(),
                    endpoint: relay.unwrap_or(m.endpoint),
                    can_relay: may_relay && relay.is_none(),
                    is_relay: relay.is_some(),
                }
            })
            .collect()
    }

    /// Every confirmed member with the host endpoint it must use
    pub(crate) fn launch_targets(&self) -> Option<Vec<LaunchTarget>> {
        let owner = self.owner_endpoint?;
        Some(
            self.members
                .iter()
                .filter(|(_, m)| m.is_confirmed())
                .map(|(token, m)| LaunchTarget {
                    token: *token,
                    endpoint: m.endpoint,
                    host: self.route(m.endpoint, owner).unwrap_or(owner),
                    is_owner: self.owner_token == Some(*token),
                })
                .collect(),
        )
    }
}

/// A room: public info plus locked state
pub struct Room {
    pub id: RoomId,
    pub description: RoomDescription,
    pub owner_identity: String,
    pub owner_name: String,
    /// UDP server endpoint handed to members at join
    pub udp_server: String,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(
        id: RoomId,
        description: RoomDescription,
        owner: &Identity,
        udp_server: impl Into<String>,
    ) -> Self {
        Self {
            id,
            description,
            owner_identity: owner.id.clone(),
            owner_name: owner.name.clone(),
            udp_server: udp_server.into(),
            state: Mutex::new(RoomState::default()),
        }
    }

    /// Take the room lock. Never call while holding another room's lock.
    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock()
    }

    pub fn owner_endpoint(&self) -> Option<SocketAddr> {
        self.lock().owner_endpoint()
    }

    pub fn status_for(&self, identity: &str, max_peers: usize) -> UserStatus {
        let state = self.lock();
        UserStatus {
            joined: state.token_of(identity).is_some(),
            host: self.owner_identity == identity,
            max_peers,
            peers: state.member_count(),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.description.name)
            .field("owner", &self.owner_name)
            .finish()
    }
}
