//! Relay rendezvous service
//!
//! The room server registers a pairing of two (address, token) pairs before
//! any relay traffic flows. Each side then sends one rendezvous datagram
//! carrying its token; that confirms the side's endpoint. Once both sides
//! are confirmed, the pending records are replaced by two live links keyed
//! by endpoint, and every datagram from one endpoint is forwarded verbatim
//! to the other. Game traffic is opaque: only the rendezvous datagram has to
//! be a GSP frame.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use gsp_core::config::RelayConfig;
use gsp_core::error::TransportError;
use gsp_core::protocol::{frame_token, HEADER_LEN};
use gsp_core::transport::{BlockingServer, DatagramHandler, DatagramSink, ServerHandle};
use gsp_core::types::{normalize, same_address, RoomToken};

use crate::directory::RelayRegistrar;

/// Largest datagram forwarded
pub const MAX_RELAY_DATAGRAM: usize = HEADER_LEN + 1000;

/// One side of a registered pairing, waiting for its rendezvous datagram
#[derive(Debug, Clone, Copy)]
struct PendingSide {
    address: IpAddr,
    partner: RoomToken,
    endpoint: Option<SocketAddr>,
    last_active: Instant,
}

/// Live forwarding entry
#[derive(Debug, Clone, Copy)]
struct Link {
    forward_to: SocketAddr,
    last_active: Instant,
}

/// Pairing and forwarding tables
pub struct RelayRouter {
    pending: DashMap<RoomToken, PendingSide>,
    links: DashMap<SocketAddr, Link>,
    timeout: Duration,
}

impl RelayRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            links: DashMap::new(),
            timeout,
        }
    }

    /// Register a bidirectional pairing
    pub fn register(&self, addr1: IpAddr, token1: RoomToken, addr2: IpAddr, token2: RoomToken) {
        let now = Instant::now();
        self.pending.insert(
            token1,
            PendingSide {
                address: addr1,
                partner: token2,
                endpoint: None,
                last_active: now,
            },
        );
        self.pending.insert(
            token2,
            PendingSide {
                address: addr2,
                partner: token1,
                endpoint: None,
                last_active: now,
            },
        );
        debug!("Relay pairing registered: {} <-> {}", token1, token2);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Where datagrams from `src` go, refreshing the link
    fn forward_target(&self, src: SocketAddr, now: Instant) -> Option<SocketAddr> {
        self.links.get_mut(&src).map(|mut link| {
            link.last_active = now;
            link.forward_to
        })
    }

    /// Rendezvous datagram from `src` bearing `token`
    fn confirm(&self, token: RoomToken, src: SocketAddr, now: Instant) {
        let partner = {
            let Some(mut side) = self.pending.get_mut(&token) else {
                return;
            };
            if !same_address(side.address, src.ip()) {
                debug!("Relay token {} from unexpected address {}", token, src);
                return;
            }
            side.endpoint = Some(src);
            side.last_active = now;
            side.partner
        };

        let Some(partner_endpoint) = self.pending.get(&partner).and_then(|p| p.endpoint) else {
            return;
        };

        self.pending.remove(&token);
        self.pending.remove(&partner);
        self.links.insert(
            src,
            Link {
                forward_to: partner_endpoint,
                last_active: now,
            },
        );
        self.links.insert(
            partner_endpoint,
            Link {
                forward_to: src,
                last_active: now,
            },
        );
        info!("Relay link live: {} <-> {}", src, partner_endpoint);
    }

    /// Drop pending sides and links idle for longer than the timeout
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len() + self.links.len();
        self.pending
            .retain(|_, side| now.saturating_duration_since(side.last_active) <= timeout);
        self.links
            .retain(|_, link| now.saturating_duration_since(link.last_active) <= timeout);
        let removed = before.saturating_sub(self.pending.len() + self.links.len());
        if removed > 0 {
            debug!("Relay sweep removed {} entries", removed);
        }
        removed
    }
}

impl DatagramHandler for RelayRouter {
    fn handle(
        &self,
        sink: &dyn DatagramSink,
        src: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), TransportError> {
        let src = normalize(src);
        let now = Instant::now();

        if let Some(to) = self.forward_target(src, now) {
            if datagram.len() > MAX_RELAY_DATAGRAM {
                debug!("Relay dropped {} byte datagram from {}", datagram.len(), src);
                return Ok(());
            }
            sink.send_to(datagram, to)?;
            return Ok(());
        }

        let token = frame_token(datagram)?;
        self.confirm(token, src, now);
        Ok(())
    }
}

/// Running relay: router plus its UDP loop
pub struct RelayService {
    router: Arc<RelayRouter>,
    handle: ServerHandle,
    public_address: IpAddr,
}

impl RelayService {
    pub fn start(config: &RelayConfig) -> std::io::Result<Self> {
        let router = Arc::new(RelayRouter::new(config.client_timeout()));
        let sweeper = router.clone();
        let handle = BlockingServer::new(
            "relay",
            SocketAddr::new(config.bind, config.port),
            router.clone(),
        )
        .with_fn_task("relay-sweep", config.sweep_interval(), move |ctx| {
            sweeper.sweep(ctx.now);
            Ok(())
        })
        .start()?;

        Ok(Self {
            router,
            handle,
            public_address: config.public_address,
        })
    }

    /// Register a pairing and return the UDP port both sides must target
    pub fn register(&self, addr1: IpAddr, token1: RoomToken, addr2: IpAddr, token2: RoomToken) -> u16 {
        self.router.register(addr1, token1, addr2, token2);
        self.handle.local_addr().port()
    }

    pub fn router(&self) -> &Arc<RelayRouter> {
        &self.router
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Endpoint advertised to room members
    pub fn public_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.public_address, self.handle.local_addr().port())
    }

    pub fn shutdown(self) {
        self.handle.shutdown();
        info!("Relay stopped");
    }
}

impl RelayRegistrar for RelayService {
    fn register(
        &self,
        addr1: IpAddr,
        token1: RoomToken,
        addr2: IpAddr,
        token2: RoomToken,
    ) -> SocketAddr {
        let port = RelayService::register(self, addr1, token1, addr2, token2);
        SocketAddr::new(self.public_address, port)
    }
}
