//! Room directory
//!
//! Process-wide registry of rooms and memberships, owned by one
//! [`RoomDirectory`] instance so tests can run isolated directories.
//!
//! Lookup tables (id → room, token → room, identity → room id) are
//! `DashMap`s. The enumerable room list has its own mutex. Per-room state is
//! behind each room's own lock. Locking rules:
//!
//! - never take a room lock while holding a map guard (clone the `Arc` out
//!   first)
//! - never take a second room lock while holding one
//! - table cleanup and room removal run after the room lock is released

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use gsp_core::config::RoomConfig;
use gsp_core::types::{RoomId, RoomToken, TokenMint};

use crate::recent::RecentList;
use crate::room::{
    Closure, Confirm, Identity, LaunchTarget, MemberInfo, Room, RoomDescription, RoomInfo,
    UserStatus,
};

/// Directory errors, returned synchronously to the account layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("operation not allowed for this identity")]
    NotAllowed,

    #[error("already joined another room")]
    JoinedElsewhere,

    #[error("already joined this room")]
    AlreadyJoined,

    #[error("room is full ({max} peers)")]
    RoomFull { max: usize },

    #[error("room owner has not connected yet")]
    OwnerNotReady,

    #[error("not a member of this room")]
    NotMember,

    #[error("no member at {0}")]
    PeerNotFound(SocketAddr),

    #[error("unknown token {0}")]
    UnknownToken(RoomToken),

    #[error("token {token} does not match endpoint {observed}")]
    EndpointMismatch { token: RoomToken, observed: SocketAddr },

    #[error("random source unavailable: {0}")]
    Rng(String),
}

/// Returned by a successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    pub room: RoomId,
    pub token: RoomToken,
    pub udp_server: String,
    pub may_relay: bool,
}

/// Room listing for one identity
#[derive(Debug, Clone)]
pub struct RoomList {
    pub can_add: bool,
    pub rooms: Vec<RoomInfo>,
}

/// What the relay service needs to pair two members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPairing {
    pub self_address: IpAddr,
    pub self_token: RoomToken,
    pub self_endpoint: SocketAddr,
    pub peer_address: IpAddr,
    pub peer_token: RoomToken,
    pub peer_endpoint: SocketAddr,
}

/// Registers a pairing with a relay and returns the endpoint to use
pub trait RelayRegistrar {
    fn register(
        &self,
        addr1: IpAddr,
        token1: RoomToken,
        addr2: IpAddr,
        token2: RoomToken,
    ) -> SocketAddr;
}

/// Outcome of a dead member sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub members: usize,
    pub rooms: usize,
    pub identities: usize,
}

pub struct RoomDirectory {
    config: RoomConfig,
    mint: TokenMint,
    rooms: DashMap<RoomId, Arc<Room>>,
    by_token: DashMap<RoomToken, Arc<Room>>,
    by_identity: DashMap<String, RoomId>,
    list: Mutex<Vec<Arc<Room>>>,
    updates_tx: Sender<SocketAddr>,
    updates_rx: Receiver<SocketAddr>,
    recent_tokens: RecentList<RoomToken>,
    recent_rooms: RecentList<RoomId>,
}

impl RoomDirectory {
    /// Create an empty directory with a randomly keyed token mint
    pub fn new(config: RoomConfig) -> Result<Self, DirectoryError> {
        let mint = TokenMint::new().map_err(|e| DirectoryError::Rng(e.to_string()))?;
        Ok(Self::with_mint(config, mint))
    }

    pub fn with_mint(config: RoomConfig, mint: TokenMint) -> Self {
        let (updates_tx, updates_rx) = unbounded();
        Self {
            config,
            mint,
            rooms: DashMap::new(),
            by_token: DashMap::new(),
            by_identity: DashMap::new(),
            list: Mutex::new(Vec::new()),
            updates_tx,
            updates_rx,
            recent_tokens: RecentList::default(),
            recent_rooms: RecentList::default(),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.by_token.len()
    }

    pub fn room(&self, id: RoomId) -> Option<Arc<Room>> {
        self.rooms.get(&id).map(|r| r.value().clone())
    }

    pub fn room_for_token(&self, token: RoomToken) -> Option<Arc<Room>> {
        self.by_token.get(&token).map(|r| r.value().clone())
    }

    fn require_room(&self, id: RoomId) -> Result<Arc<Room>, DirectoryError> {
        self.room(id).ok_or(DirectoryError::RoomNotFound(id))
    }

    fn notify(&self, endpoints: Vec<SocketAddr>) {
        for ep in endpoints {
            // Receiver lives as long as self
            let _ = self.updates_tx.send(ep);
        }
    }

    /// Create a room owned by `owner`. The owner still has to join it as host.
    pub fn create_room(
        &self,
        description: RoomDescription,
        owner: &Identity,
    ) -> Result<Arc<Room>, DirectoryError> {
        if !owner.may_create_room {
            return Err(DirectoryError::NotAllowed);
        }

        let id = self.mint.next_room_id();
        let room = Arc::new(Room::new(
            id,
            description,
            owner,
            self.config.public_endpoint(),
        ));
        self.rooms.insert(id, room.clone());
        self.list.lock().push(room.clone());

        info!("Room {} created by {}", id, owner.name);
        Ok(room)
    }

    /// Add `identity` to a room and mint its rendezvous token.
    ///
    /// `address` is the caller's address as seen by the account layer; the
    /// port is learned from the first UDP datagram.
    pub fn join(
        &self,
        id: RoomId,
        address: IpAddr,
        identity: &Identity,
        is_host: bool,
    ) -> Result<LoginInfo, DirectoryError> {
        let room = self.require_room(id)?;
        if is_host && room.owner_identity != identity.id {
            return Err(DirectoryError::NotAllowed);
        }
        if !is_host && !identity.may_use_room {
            return Err(DirectoryError::NotAllowed);
        }

        let token = self.mint.next_token();
        let notify = {
            let mut state = room.lock();
            if state.is_closed() {
                return Err(DirectoryError::RoomNotFound(id));
            }
            if state.token_of(&identity.id).is_some() {
                return Err(DirectoryError::AlreadyJoined);
            }
            if state.member_count() >= self.config.max_peers {
                return Err(DirectoryError::RoomFull {
                    max: self.config.max_peers,
                });
            }
            if !is_host && state.owner_endpoint().is_none() {
                return Err(DirectoryError::OwnerNotReady);
            }

            match self.by_identity.entry(identity.id.clone()) {
                Entry::Occupied(mut e) => {
                    let current = *e.get();
                    if current != id && self.rooms.contains_key(&current) {
                        return Err(DirectoryError::JoinedElsewhere);
                    }
                    e.insert(id);
                }
                Entry::Vacant(e) => {
                    e.insert(id);
                }
            }
            self.by_token.insert(token, room.clone());

            state.add_member(
                token,
                &identity.id,
                &identity.name,
                address,
                is_host,
                Instant::now(),
            )
        };
        self.notify(notify);

        debug!("{} joined room {} (token {})", identity.name, id, token);
        Ok(LoginInfo {
            room: id,
            token,
            udp_server: room.udp_server.clone(),
            may_relay: identity.may_relay,
        })
    }

    /// Match a datagram source against the membership behind `token`.
    ///
    /// Confirms the member on its first datagram and refreshes its activity
    /// on every accepted one.
    pub fn confirm_endpoint(
        &self,
        token: RoomToken,
        observed: SocketAddr,
    ) -> Result<Arc<Room>, DirectoryError> {
        let room = self
            .room_for_token(token)
            .ok_or(DirectoryError::UnknownToken(token))?;

        let outcome = room.lock().confirm(token, observed, Instant::now());
        match outcome {
            Confirm::Refreshed => Ok(room),
            Confirm::Confirmed { notify } => {
                debug!("Token {} confirmed at {}", token, observed);
                self.notify(notify);
                Ok(room)
            }
            Confirm::Rejected => Err(DirectoryError::EndpointMismatch { token, observed }),
        }
    }

    /// Remove `identity` from a room. The owner leaving closes the room.
    pub fn exit(&self, id: RoomId, identity: &str) -> Result<(), DirectoryError> {
        let room = self.require_room(id)?;
        let token = room
            .lock()
            .token_of(identity)
            .ok_or(DirectoryError::NotMember)?;
        self.exit_member(&room, token)
    }

    /// Remove the membership behind `token`
    pub fn exit_token(&self, token: RoomToken) -> Result<(), DirectoryError> {
        let room = self
            .room_for_token(token)
            .ok_or(DirectoryError::UnknownToken(token))?;
        self.exit_member(&room, token)
    }

    fn exit_member(&self, room: &Arc<Room>, token: RoomToken) -> Result<(), DirectoryError> {
        let departure = room
            .lock()
            .remove(token)
            .ok_or(DirectoryError::UnknownToken(token))?;

        self.forget_token(token, Instant::now());
        self.by_identity
            .remove_if(&departure.identity, |_, v| *v == room.id);
        self.notify(departure.notify);

        debug!("Token {} left room {}", token, room.id);
        if departure.was_owner {
            self.remove_room(room.id);
        }
        Ok(())
    }

    fn forget_token(&self, token: RoomToken, now: Instant) {
        if self.by_token.remove(&token).is_some() {
            self.recent_tokens.add(token, now);
        }
    }

    /// Remove a room and every membership in it
    pub fn remove_room(&self, id: RoomId) -> bool {
        let Some((_, room)) = self.rooms.remove(&id) else {
            return false;
        };
        let closure = room.lock().close();
        self.release(id, closure);
        true
    }

    /// Drop table entries of a closed room
    fn release(&self, id: RoomId, closure: Closure) {
        let now = Instant::now();
        for token in closure.tokens {
            self.forget_token(token, now);
        }
        for identity in closure.identities {
            self.by_identity.remove_if(&identity, |_, v| *v == id);
        }
        self.list.lock().retain(|r| r.id != id);
        self.recent_rooms.add(id, now);

        info!("Room {} removed", id);
    }

    /// Snapshot the launch targets and remove the room.
    ///
    /// The room is closed under the same lock as the snapshot, so a
    /// concurrent second launch finds it gone.
    pub fn launch(&self, id: RoomId) -> Result<Vec<LaunchTarget>, DirectoryError> {
        let room = self.require_room(id)?;
        let (targets, closure) = {
            let mut state = room.lock();
            if state.is_closed() {
                return Err(DirectoryError::RoomNotFound(id));
            }
            let targets = state.launch_targets().ok_or(DirectoryError::OwnerNotReady)?;
            (targets, state.close())
        };

        self.rooms.remove(&id);
        self.release(id, closure);

        info!("Room {} launched with {} members", id, targets.len());
        Ok(targets)
    }

    /// Record a relay between `identity` and the member at `other`
    pub fn set_relay(
        &self,
        id: RoomId,
        identity: &str,
        other: SocketAddr,
        relay: SocketAddr,
    ) -> Result<(), DirectoryError> {
        let room = self.require_room(id)?;
        let notify = {
            let mut state = room.lock();
            let me = state
                .token_of(identity)
                .and_then(|t| state.member(t))
                .filter(|m| m.is_confirmed())
                .map(|m| m.endpoint)
                .ok_or(DirectoryError::NotMember)?;
            if state.find_by_endpoint(other).is_none() {
                return Err(DirectoryError::PeerNotFound(other));
            }
            state.set_route(me, other, relay);
            state.confirmed_endpoints()
        };
        self.notify(notify);

        info!("Relay {} set in room {} for {} <-> {}", relay, id, identity, other);
        Ok(())
    }

    /// Collect the (address, token) pairs a relay needs to pair `identity`
    /// with the member at `peer`
    pub fn prepare_relay(
        &self,
        id: RoomId,
        identity: &Identity,
        peer: SocketAddr,
    ) -> Result<RelayPairing, DirectoryError> {
        if !identity.may_relay {
            return Err(DirectoryError::NotAllowed);
        }
        let room = self.require_room(id)?;
        let state = room.lock();

        let self_token = state.token_of(&identity.id).ok_or(DirectoryError::NotMember)?;
        let me = state
            .member(self_token)
            .filter(|m| m.is_confirmed())
            .ok_or(DirectoryError::NotMember)?;
        let (peer_token, other) = state
            .find_by_endpoint(peer)
            .ok_or(DirectoryError::PeerNotFound(peer))?;

        Ok(RelayPairing {
            self_address: me.endpoint.ip(),
            self_token,
            self_endpoint: me.endpoint,
            peer_address: other.endpoint.ip(),
            peer_token,
            peer_endpoint: other.endpoint,
        })
    }

    /// Pair `identity` with the member at `peer` through a relay and record
    /// the route. Returns the relay endpoint.
    pub fn establish_relay(
        &self,
        id: RoomId,
        identity: &Identity,
        peer: SocketAddr,
        relay: &dyn RelayRegistrar,
    ) -> Result<SocketAddr, DirectoryError> {
        let pairing = self.prepare_relay(id, identity, peer)?;
        let endpoint = relay.register(
            pairing.self_address,
            pairing.self_token,
            pairing.peer_address,
            pairing.peer_token,
        );
        self.set_relay(id, &identity.id, pairing.peer_endpoint, endpoint)?;
        Ok(endpoint)
    }

    /// Roster of a room as seen by `identity`
    pub fn members_for(
        &self,
        id: RoomId,
        identity: &str,
        may_relay: bool,
    ) -> Result<Vec<MemberInfo>, DirectoryError> {
        let room = self.require_room(id)?;
        let roster = room.lock().roster_for(identity, may_relay);
        Ok(roster)
    }

    pub fn user_status(&self, id: RoomId, identity: &str) -> Result<UserStatus, DirectoryError> {
        let room = self.require_room(id)?;
        Ok(room.status_for(identity, self.config.max_peers))
    }

    /// Rooms whose owner is connected
    pub fn list_rooms(&self, identity: &Identity) -> RoomList {
        let snapshot: Vec<Arc<Room>> = self.list.lock().clone();

        let rooms = snapshot
            .iter()
            .filter(|room| room.owner_endpoint().is_some())
            .map(|room| {
                let status = room.status_for(&identity.id, self.config.max_peers);
                RoomInfo {
                    id: room.id,
                    name: room.description.name.clone(),
                    description: room.description.description.clone(),
                    owner_name: room.owner_name.clone(),
                    image: room.description.image.clone(),
                    status,
                    can_join: !status.joined && identity.may_use_room,
                    can_launch: status.host,
                }
            })
            .collect();

        RoomList {
            can_add: identity.may_create_room,
            rooms,
        }
    }

    /// Exit members silent since before `now - timeout`, remove rooms left
    /// empty and drop identity mappings to rooms that no longer exist
    pub fn sweep_dead(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(deadline) = now.checked_sub(self.config.dead_member_timeout()) else {
            return report;
        };

        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        for room in rooms {
            let idle = room.lock().idle_since(deadline);
            for token in idle {
                if self.exit_member(&room, token).is_ok() {
                    report.members += 1;
                }
            }

            let empty = {
                let state = room.lock();
                !state.is_closed() && state.member_count() == 0
            };
            if empty {
                self.remove_room(room.id);
            }
            if !self.rooms.contains_key(&room.id) {
                report.rooms += 1;
            }
        }

        let stale: Vec<String> = self
            .by_identity
            .iter()
            .filter(|e| !self.rooms.contains_key(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for identity in stale {
            if self
                .by_identity
                .remove_if(&identity, |_, id| !self.rooms.contains_key(id))
                .is_some()
            {
                report.identities += 1;
            }
        }

        if report.members > 0 || report.rooms > 0 {
            info!(
                "Sweep removed {} members, {} rooms",
                report.members, report.rooms
            );
        }
        report
    }

    /// Next endpoint to poke with a RoomEvent
    pub fn pop_update(&self) -> Option<SocketAddr> {
        self.updates_rx.try_recv().ok()
    }

    pub fn pending_updates(&self) -> usize {
        self.updates_rx.len()
    }

    pub fn is_recently_removed_token(&self, token: RoomToken) -> bool {
        self.recent_tokens.contains(&token, Instant::now())
    }

    pub fn is_recently_removed_room(&self, id: RoomId) -> bool {
        self.recent_rooms.contains(&id, Instant::now())
    }
}
