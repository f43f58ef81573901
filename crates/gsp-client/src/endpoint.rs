//! Member-side UDP endpoint
//!
//! [`RoomClient`] owns one socket, served by a single-threaded
//! [`PollServer`]. The loop answers and sends peer pings, keeps the room
//! server aware of our NAT mapping, and runs the host's launch handshake.
//! Everything the owner needs to react to arrives as a [`ClientEvent`].
//!
//! Public calls never touch the socket: they hand work to the loop through
//! shared state and wait on a one-shot channel for the outcome.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use gsp_core::config::ClientConfig;
use gsp_core::error::TransportError;
use gsp_core::protocol::{Header, MessageType, Packet};
use gsp_core::transport::{
    DatagramHandler, DatagramSink, PollServer, ServerHandle, TaskContext, TaskScope,
};
use gsp_core::types::{ipv4_of, normalize, same_endpoint, RoomToken};

use crate::error::{ClientError, LaunchError};
use crate::events::ClientEvent;
use crate::peer::{Peer, PeerStats, PingTimings, RosterEntry};

/// Roster waiting to be applied by the loop, with its completion signal
struct RosterUpdate {
    roster: Vec<RosterEntry>,
    done: Sender<()>,
}

/// Host-side launch handshake
#[derive(Default)]
struct LaunchRequest {
    seq: Option<u16>,
    last_sent: Option<Instant>,
    acked: bool,
    host: Option<SocketAddr>,
    done: Option<Sender<SocketAddr>>,
}

/// Server liveness pings
#[derive(Default)]
struct ServerLiveness {
    next_send: Option<Instant>,
    outstanding_since: Option<Instant>,
}

/// State shared by the loop and the [`RoomClient`] handle
struct ClientCore {
    server: SocketAddr,
    token: RoomToken,
    config: ClientConfig,
    timings: PingTimings,
    seq: AtomicU16,

    peers: Mutex<Vec<Peer>>,
    roster_inbox: Mutex<Option<RosterUpdate>>,
    launch: Mutex<Option<LaunchRequest>>,
    liveness: Mutex<ServerLiveness>,
    next_roster_poll: Mutex<Instant>,

    observed: Mutex<Option<SocketAddr>>,
    host: Mutex<Option<SocketAddr>>,
    launched: AtomicBool,

    events: Sender<ClientEvent>,
}

impl ClientCore {
    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn emit(&self, event: ClientEvent) {
        // The receiver lives in the RoomClient; once it is gone nobody listens
        let _ = self.events.send(event);
    }

    fn send_header(
        &self,
        sink: &dyn DatagramSink,
        msg_type: MessageType,
        seq: u16,
        to: SocketAddr,
    ) -> Result<(), TransportError> {
        sink.send_to(&Header::new(msg_type, seq, self.token).to_bytes(), to)?;
        Ok(())
    }

    fn from_server(&self, packet: &Packet, sink: &dyn DatagramSink, now: Instant) -> Result<(), TransportError> {
        let header = packet.header;
        match header.msg_type {
            MessageType::SelfReply => {
                let endpoint = SocketAddr::V4(packet.endpoint);
                self.liveness.lock().outstanding_since = None;
                let mut observed = self.observed.lock();
                if *observed != Some(endpoint) {
                    debug!("Server sees us at {}", endpoint);
                    *observed = Some(endpoint);
                }
            }
            MessageType::Ack => {
                self.liveness.lock().outstanding_since = None;
                if let Some(request) = self.launch.lock().as_mut() {
                    if !request.acked && request.seq == Some(header.seq) {
                        debug!("Launch acknowledged by server");
                        request.acked = true;
                    }
                }
            }
            MessageType::RoomEvent => {
                *self.next_roster_poll.lock() = now + self.config.roster_poll();
                self.emit(ClientEvent::RefreshRoster);
            }
            MessageType::LaunchEvent => {
                let host = SocketAddr::V4(packet.endpoint);
                self.send_header(sink, MessageType::LaunchEventAck, header.seq, self.server)?;
                *self.host.lock() = Some(host);

                if let Some(request) = self.launch.lock().as_mut() {
                    request.host = Some(host);
                    return Ok(());
                }
                if !self.launched.swap(true, Ordering::AcqRel) {
                    info!("Room launched, host {}", host);
                    self.emit(ClientEvent::Launched { host });
                }
            }
            other => trace!("Ignoring {:?} from server", other),
        }
        Ok(())
    }

    fn from_peer(&self, src: SocketAddr, header: Header, sink: &dyn DatagramSink, now: Instant) -> Result<(), TransportError> {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.iter_mut().find(|p| p.endpoint() == src) else {
            trace!("Datagram from unknown source {}", src);
            return Ok(());
        };
        match header.msg_type {
            MessageType::Ping => {
                peer.on_ping();
                drop(peers);
                self.send_header(sink, MessageType::Ack, header.seq, src)?;
            }
            MessageType::Ack => {
                peer.on_ack(header.seq, now);
            }
            other => trace!("Ignoring {:?} from peer {}", other, src),
        }
        Ok(())
    }

    /// Reconcile the peer list with a roster: refresh known peers, drop
    /// missing ones and add new ones. Unconfirmed entries (port 0) are
    /// skipped.
    fn apply_roster(&self, roster: &[RosterEntry]) {
        let roster: Vec<RosterEntry> = roster
            .iter()
            .filter(|e| e.endpoint.port() != 0)
            .map(|e| RosterEntry {
                endpoint: normalize(e.endpoint),
                ..e.clone()
            })
            .collect();

        let mut peers = self.peers.lock();
        peers.retain(|p| roster.iter().any(|e| e.endpoint == p.endpoint()));
        for entry in &roster {
            match peers.iter_mut().find(|p| p.endpoint() == entry.endpoint) {
                Some(peer) => peer.update(entry),
                None => {
                    debug!("Peer {} at {}", entry.name, entry.endpoint);
                    peers.push(Peer::new(entry));
                }
            }
        }
    }

    fn run_roster_apply(&self) {
        let Some(update) = self.roster_inbox.lock().take() else {
            return;
        };
        self.apply_roster(&update.roster);
        let _ = update.done.send(());
    }

    fn run_pings(&self, ctx: &TaskContext<'_>) -> Result<(), TransportError> {
        let due: Vec<(SocketAddr, u16)> = {
            let mut peers = self.peers.lock();
            peers
                .iter_mut()
                .filter_map(|p| {
                    p.poll_ping(ctx.now, &self.timings, || self.next_seq())
                        .map(|seq| (p.endpoint(), seq))
                })
                .collect()
        };
        for (endpoint, seq) in due {
            self.send_header(ctx.sink, MessageType::Ping, seq, endpoint)?;
        }
        Ok(())
    }

    fn run_server_ping(&self, ctx: &TaskContext<'_>) -> Result<(), TransportError> {
        let mut liveness = self.liveness.lock();
        if let Some(since) = liveness.outstanding_since {
            if ctx.now.saturating_duration_since(since) > self.config.server_timeout() {
                warn!("Room server {} not answering", self.server);
                liveness.outstanding_since = None;
                self.emit(ClientEvent::ServerTimeout);
            }
        }
        if matches!(liveness.next_send, Some(at) if ctx.now < at) {
            return Ok(());
        }
        liveness.next_send = Some(ctx.now + self.config.server_ping());
        liveness.outstanding_since.get_or_insert(ctx.now);
        drop(liveness);
        self.send_header(ctx.sink, MessageType::SelfQuery, self.next_seq(), self.server)
    }

    fn run_roster_poll(&self, now: Instant) {
        let mut next = self.next_roster_poll.lock();
        if now >= *next {
            *next = now + self.config.roster_poll();
            self.emit(ClientEvent::RefreshRoster);
        }
    }

    fn run_launch(&self, ctx: &TaskContext<'_>) -> Result<(), TransportError> {
        let mut slot = self.launch.lock();
        let Some(request) = slot.as_mut() else {
            return Ok(());
        };

        if let Some(host) = request.host {
            if let Some(done) = request.done.take() {
                let _ = done.send(host);
            }
            self.launched.store(true, Ordering::Release);
            *slot = None;
            return Ok(());
        }

        if request.acked {
            return Ok(());
        }
        let due = request
            .last_sent
            .map_or(true, |at| ctx.now.saturating_duration_since(at) >= self.config.launch_repeat());
        if !due {
            return Ok(());
        }
        let seq = match request.seq {
            Some(seq) => seq,
            None => {
                let seq = self.next_seq();
                request.seq = Some(seq);
                seq
            }
        };
        request.last_sent = Some(ctx.now);
        drop(slot);
        debug!("Sending Launch (seq {})", seq);
        self.send_header(ctx.sink, MessageType::Launch, seq, self.server)
    }
}

impl DatagramHandler for ClientCore {
    fn handle(
        &self,
        sink: &dyn DatagramSink,
        src: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), TransportError> {
        let packet = Packet::decode(datagram)?;
        let src = normalize(src);
        let now = Instant::now();

        if same_endpoint(src, self.server) {
            self.from_server(&packet, sink, now)
        } else {
            self.from_peer(src, packet.header, sink, now)
        }
    }
}

/// Handle to a running member endpoint
pub struct RoomClient {
    core: Arc<ClientCore>,
    handle: ServerHandle,
    events: Receiver<ClientEvent>,
}

impl RoomClient {
    /// Bind an ephemeral port and start talking to the room server at
    /// `server` with the rendezvous token from the join.
    pub fn connect(
        server: SocketAddr,
        token: RoomToken,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self::connect_from(bind, server, token, config)
    }

    /// Like [`connect`](Self::connect), binding `bind` instead
    pub fn connect_from(
        bind: SocketAddr,
        server: SocketAddr,
        token: RoomToken,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let server_v4 = ipv4_of(server.ip()).ok_or(ClientError::NotIpv4(server))?;
        let server = SocketAddr::new(IpAddr::V4(server_v4), server.port());

        let (events_tx, events) = unbounded();
        let core = Arc::new(ClientCore {
            server,
            token,
            timings: PingTimings::from(&config),
            config: config.clone(),
            seq: AtomicU16::new(0),
            peers: Mutex::new(Vec::new()),
            roster_inbox: Mutex::new(None),
            launch: Mutex::new(None),
            liveness: Mutex::new(ServerLiveness::default()),
            next_roster_poll: Mutex::new(Instant::now()),
            observed: Mutex::new(None),
            host: Mutex::new(None),
            launched: AtomicBool::new(false),
            events: events_tx,
        });

        let roster = core.clone();
        let pings = core.clone();
        let liveness = core.clone();
        let poll = core.clone();
        let launch = core.clone();
        let handle = PollServer::new("client", bind, core.clone())
            .threads(1)
            .with_fn_task("roster-apply", Duration::ZERO, TaskScope::Global, move |_| {
                roster.run_roster_apply();
                Ok(())
            })
            .with_fn_task("peer-ping", config.ping_batch(), TaskScope::Global, move |ctx| {
                pings.run_pings(ctx)
            })
            .with_fn_task("server-ping", Duration::ZERO, TaskScope::Global, move |ctx| {
                liveness.run_server_ping(ctx)
            })
            .with_fn_task("roster-poll", Duration::ZERO, TaskScope::Global, move |ctx| {
                poll.run_roster_poll(ctx.now);
                Ok(())
            })
            .with_fn_task("launch", Duration::ZERO, TaskScope::Global, move |ctx| {
                launch.run_launch(ctx)
            })
            .start()?;

        info!("Client {} talking to room server {}", handle.local_addr(), server);
        Ok(Self {
            core,
            handle,
            events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn server(&self) -> SocketAddr {
        self.core.server
    }

    pub fn token(&self) -> RoomToken {
        self.core.token
    }

    /// Our endpoint as last reported by the room server
    pub fn observed_endpoint(&self) -> Option<SocketAddr> {
        *self.core.observed.lock()
    }

    /// Host endpoint from the last LaunchEvent
    pub fn host(&self) -> Option<SocketAddr> {
        *self.core.host.lock()
    }

    pub fn events(&self) -> Receiver<ClientEvent> {
        self.events.clone()
    }

    pub fn peers(&self) -> Vec<PeerStats> {
        self.core.peers.lock().iter().map(Peer::stats).collect()
    }

    /// Hand a fresh roster to the loop. Returns whether the loop applied it
    /// within the server timeout.
    pub fn update_peers(&self, roster: Vec<RosterEntry>) -> bool {
        let (done, applied) = bounded(1);
        if let Some(stale) = self
            .core
            .roster_inbox
            .lock()
            .replace(RosterUpdate { roster, done })
        {
            trace!("Replacing {} unapplied roster entries", stale.roster.len());
        }
        applied.recv_timeout(self.core.config.server_timeout()).is_ok()
    }

    /// Ask the server to launch the room and wait for our host endpoint.
    /// Only the room owner gets an answer.
    pub fn request_launch(&self) -> Result<SocketAddr, LaunchError> {
        let (done, result) = bounded(1);
        *self.core.launch.lock() = Some(LaunchRequest {
            done: Some(done),
            ..LaunchRequest::default()
        });

        match result.recv_timeout(self.core.config.launch_timeout()) {
            Ok(host) => Ok(host),
            Err(RecvTimeoutError::Timeout) => {
                self.core.launch.lock().take();
                warn!("Launch request timed out");
                self.core.emit(ClientEvent::ServerTimeout);
                Err(LaunchError::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(LaunchError::Stopped),
        }
    }

    pub fn shutdown(self) {
        self.handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            ping_batch_ms: 10,
            ping_interval_ms: 50,
            ping_repeat_ms: 100,
            server_ping_secs: 1,
            server_timeout_secs: 1,
            launch_timeout_secs: 1,
            launch_repeat_ms: 100,
            ..ClientConfig::default()
        }
    }

    /// A socket standing in for the room server
    fn fake_server() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        socket
    }

    fn recv_type(socket: &UdpSocket, wanted: MessageType, within: Duration) -> Option<(Header, SocketAddr)> {
        let deadline = Instant::now() + within;
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            if let Ok((len, from)) = socket.recv_from(&mut buf) {
                if let Ok(header) = Header::decode(&buf[..len]) {
                    if header.msg_type == wanted {
                        return Some((header, from));
                    }
                }
            }
        }
        None
    }

    fn wait_event(events: &Receiver<ClientEvent>, wanted: fn(&ClientEvent) -> bool, within: Duration) -> Option<ClientEvent> {
        let deadline = Instant::now() + within;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if wanted(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn connect(server: &UdpSocket, token: u64) -> RoomClient {
        RoomClient::connect_from(
            "127.0.0.1:0".parse().unwrap(),
            server.local_addr().unwrap(),
            RoomToken(token),
            fast_config(),
        )
        .unwrap()
    }

    #[test]
    fn test_pings_server_with_own_token() {
        let server = fake_server();
        let client = connect(&server, 42);

        let (header, from) =
            recv_type(&server, MessageType::SelfQuery, Duration::from_secs(2)).unwrap();
        assert_eq!(header.token, RoomToken(42));
        assert_eq!(from, client.local_addr());

        let reply = Packet::with_endpoint(
            Header::new(MessageType::SelfReply, header.seq, header.token),
            "198.51.100.7:6000".parse().unwrap(),
        )
        .unwrap();
        server.send_to(&reply.to_bytes(), from).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.observed_endpoint().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            client.observed_endpoint(),
            Some("198.51.100.7:6000".parse().unwrap())
        );
        client.shutdown();
    }

    #[test]
    fn test_silent_server_times_out() {
        let server = fake_server();
        let client = connect(&server, 1);
        let events = client.events();
        assert_eq!(
            wait_event(&events, |e| *e == ClientEvent::ServerTimeout, Duration::from_secs(4)),
            Some(ClientEvent::ServerTimeout)
        );
        client.shutdown();
    }

    #[test]
    fn test_launch_without_answer_fails() {
        let server = fake_server();
        let client = connect(&server, 1);
        let events = client.events();

        assert_eq!(client.request_launch(), Err(LaunchError::TimedOut));
        assert!(wait_event(&events, |e| *e == ClientEvent::ServerTimeout, Duration::from_secs(3)).is_some());
        // Launch was retransmitted with one sequence
        let first = recv_type(&server, MessageType::Launch, Duration::from_secs(1)).unwrap().0;
        let second = recv_type(&server, MessageType::Launch, Duration::from_secs(1)).unwrap().0;
        assert_eq!(first.seq, second.seq);
        client.shutdown();
    }

    #[test]
    fn test_launch_event_is_acked_and_reported_once() {
        let server = fake_server();
        let client = connect(&server, 7);
        let events = client.events();
        let (_, to) = recv_type(&server, MessageType::SelfQuery, Duration::from_secs(2)).unwrap();

        let host: SocketAddr = "203.0.113.5:7777".parse().unwrap();
        let event = Packet::with_endpoint(
            Header::new(MessageType::LaunchEvent, 99, RoomToken::NONE),
            host,
        )
        .unwrap();
        server.send_to(&event.to_bytes(), to).unwrap();
        server.send_to(&event.to_bytes(), to).unwrap();

        for _ in 0..2 {
            let (ack, _) =
                recv_type(&server, MessageType::LaunchEventAck, Duration::from_secs(2)).unwrap();
            assert_eq!(ack.seq, 99);
            assert_eq!(ack.token, RoomToken(7));
        }
        assert_eq!(
            wait_event(&events, |e| matches!(e, ClientEvent::Launched { .. }), Duration::from_secs(2)),
            Some(ClientEvent::Launched { host })
        );
        assert!(wait_event(&events, |e| matches!(e, ClientEvent::Launched { .. }), Duration::from_millis(300)).is_none());
        assert_eq!(client.host(), Some(host));
        client.shutdown();
    }

    #[test]
    fn test_room_event_requests_roster() {
        let server = fake_server();
        let client = connect(&server, 3);
        let events = client.events();
        let (_, to) = recv_type(&server, MessageType::SelfQuery, Duration::from_secs(2)).unwrap();
        // Initial poll fires straight away
        assert!(wait_event(&events, |e| *e == ClientEvent::RefreshRoster, Duration::from_secs(1)).is_some());

        let poke = Header::new(MessageType::RoomEvent, 5, RoomToken::NONE).to_bytes();
        server.send_to(&poke, to).unwrap();
        assert!(wait_event(&events, |e| *e == ClientEvent::RefreshRoster, Duration::from_secs(1)).is_some());
        client.shutdown();
    }

    #[test]
    fn test_answers_peer_pings() {
        let server = fake_server();
        let client = connect(&server, 11);
        let peer = fake_server();
        assert!(client.update_peers(vec![RosterEntry {
            name: "peer".into(),
            endpoint: peer.local_addr().unwrap(),
            can_relay: false,
            is_relay: false,
        }]));

        // The client pings the new peer on its own
        let (ping, from) = recv_type(&peer, MessageType::Ping, Duration::from_secs(2)).unwrap();
        assert_eq!(from, client.local_addr());
        assert_eq!(ping.token, RoomToken(11));
        peer.send_to(&Header::new(MessageType::Ack, ping.seq, RoomToken(12)).to_bytes(), from)
            .unwrap();

        peer.send_to(&Header::new(MessageType::Ping, 500, RoomToken(12)).to_bytes(), from)
            .unwrap();
        let (ack, _) = recv_type(&peer, MessageType::Ack, Duration::from_secs(2)).unwrap();
        assert_eq!(ack.seq, 500);
        assert_eq!(ack.token, RoomToken(11));

        let stats = &client.peers()[0];
        assert_eq!(stats.pings_received, 1);
        assert!(stats.acks_received >= 1);
        client.shutdown();
    }

    #[test]
    fn test_roster_reconcile() {
        let server = fake_server();
        let client = connect(&server, 1);
        let entry = |name: &str, ep: &str| RosterEntry {
            name: name.into(),
            endpoint: ep.parse().unwrap(),
            can_relay: false,
            is_relay: false,
        };

        assert!(client.update_peers(vec![
            entry("a", "10.0.0.1:1000"),
            entry("b", "10.0.0.2:2000"),
            entry("pending", "10.0.0.3:0"),
        ]));
        assert_eq!(client.peers().len(), 2);

        assert!(client.update_peers(vec![
            entry("b-renamed", "10.0.0.2:2000"),
            entry("c", "10.0.0.4:4000"),
        ]));
        let mut names: Vec<String> = client.peers().into_iter().map(|p| p.name).collect();
        names.sort();
        assert_eq!(names, vec!["b-renamed".to_string(), "c".to_string()]);
        client.shutdown();
    }
}
