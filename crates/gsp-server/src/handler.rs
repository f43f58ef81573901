//! Room protocol servers
//!
//! The main port handles NAT self-echo, keepalive and the launch handshake,
//! and pokes members with RoomEvent when the roster changes. The aux port
//! only answers self-echo requests, letting a client compare the NAT mapping
//! it gets towards a second port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use gsp_core::config::RoomConfig;
use gsp_core::error::TransportError;
use gsp_core::protocol::{Header, MessageType, Packet};
use gsp_core::transport::{DatagramHandler, DatagramSink, PollServer, ServerHandle, TaskScope};
use gsp_core::types::{same_endpoint, RoomToken};

use crate::directory::{DirectoryError, RoomDirectory};
use crate::error::ServerError;
use crate::room::Room;

/// A LaunchEvent waiting for its LaunchEventAck
#[derive(Debug, Clone, Copy)]
struct PendingAck {
    endpoint: SocketAddr,
    host: SocketAddr,
    next_send: Instant,
    deadline: Instant,
}

/// Main port handler
pub struct RoomHandler {
    directory: Arc<RoomDirectory>,
    pending: DashMap<RoomToken, PendingAck>,
    seq: AtomicU16,
    retry: Duration,
    ack_timeout: Duration,
}

impl RoomHandler {
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        let retry = directory.config().launch_retry();
        let ack_timeout = directory.config().launch_ack_timeout();
        Self {
            directory,
            pending: DashMap::new(),
            seq: AtomicU16::new(0),
            retry,
            ack_timeout,
        }
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// LaunchEvents not acknowledged yet
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn send_launch_event(
        &self,
        sink: &dyn DatagramSink,
        seq: u16,
        to: SocketAddr,
        host: SocketAddr,
    ) -> Result<(), TransportError> {
        let header = Header::new(MessageType::LaunchEvent, seq, RoomToken::NONE);
        let packet = Packet::with_endpoint(header, host)?;
        sink.send_to(&packet.to_bytes(), to)?;
        Ok(())
    }

    /// Clear the pending record of `token` if `src` is its target
    fn acknowledge(&self, token: RoomToken, src: SocketAddr) -> bool {
        self.pending
            .remove_if(&token, |_, p| same_endpoint(p.endpoint, src))
            .is_some()
    }

    fn self_reply(sink: &dyn DatagramSink, header: Header, src: SocketAddr) -> Result<(), TransportError> {
        let reply = Header::new(MessageType::SelfReply, header.seq, header.token);
        let packet = Packet::with_endpoint(reply, src)?;
        sink.send_to(&packet.to_bytes(), src)?;
        Ok(())
    }

    fn launch(
        &self,
        sink: &dyn DatagramSink,
        room: &Room,
        src: SocketAddr,
        header: Header,
    ) -> Result<(), TransportError> {
        match room.owner_endpoint() {
            Some(owner) if same_endpoint(owner, src) => {}
            _ => {
                debug!("Launch for room {} from non-owner {} ignored", room.id, src);
                return Ok(());
            }
        }

        // The owner repeats Launch until this arrives
        let ack = Header::new(MessageType::Ack, header.seq, header.token);
        sink.send_to(&ack.to_bytes(), src)?;

        let targets = match self.directory.launch(room.id) {
            Ok(targets) => targets,
            Err(e) => {
                debug!("Launch of room {} failed: {}", room.id, e);
                return Ok(());
            }
        };

        let now = Instant::now();
        for target in targets.iter().filter(|t| !t.is_owner) {
            self.pending.insert(
                target.token,
                PendingAck {
                    endpoint: target.endpoint,
                    host: target.host,
                    next_send: now + self.retry,
                    deadline: now + self.ack_timeout,
                },
            );
        }

        let seq = self.next_seq();
        for target in &targets {
            if let Err(e) = self.send_launch_event(sink, seq, target.endpoint, target.host) {
                debug!("LaunchEvent to {} failed: {}", target.endpoint, e);
            }
        }
        Ok(())
    }

    /// Resend LaunchEvents past their retry time and abandon the ones past
    /// their deadline. Returns the number sent.
    pub fn resend_launch_events(&self, sink: &dyn DatagramSink, now: Instant) -> usize {
        let tokens: Vec<RoomToken> = self.pending.iter().map(|e| *e.key()).collect();
        let mut sent = 0;

        for token in tokens {
            let due = match self.pending.get_mut(&token) {
                None => continue,
                Some(mut p) if p.deadline > now => {
                    if p.next_send > now {
                        continue;
                    }
                    p.next_send = now + self.retry;
                    Some((p.endpoint, p.host))
                }
                Some(_) => None,
            };

            match due {
                Some((endpoint, host)) => {
                    match self.send_launch_event(sink, self.next_seq(), endpoint, host) {
                        Ok(()) => sent += 1,
                        Err(e) => debug!("LaunchEvent resend to {} failed: {}", endpoint, e),
                    }
                }
                None => {
                    self.pending.remove(&token);
                    debug!("LaunchEvent to token {} abandoned", token);
                }
            }
        }
        sent
    }

    /// Send the RoomEvents queued when this call started
    pub fn broadcast_room_events(&self, sink: &dyn DatagramSink) -> usize {
        let budget = self.directory.pending_updates();
        let mut sent = 0;
        for _ in 0..budget {
            let Some(endpoint) = self.directory.pop_update() else {
                break;
            };
            let header = Header::new(MessageType::RoomEvent, self.next_seq(), RoomToken::NONE);
            match sink.send_to(&header.to_bytes(), endpoint) {
                Ok(_) => sent += 1,
                Err(e) => debug!("RoomEvent to {} failed: {}", endpoint, e),
            }
        }
        sent
    }
}

impl DatagramHandler for RoomHandler {
    fn handle(
        &self,
        sink: &dyn DatagramSink,
        src: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), TransportError> {
        let packet = Packet::decode(datagram)?;
        let header = packet.header;

        // The room is gone by the time acks arrive
        if header.msg_type == MessageType::LaunchEventAck {
            if self.acknowledge(header.token, src) {
                debug!("LaunchEvent acknowledged by {}", src);
            }
            return Ok(());
        }

        let room = match self.directory.confirm_endpoint(header.token, src) {
            Ok(room) => room,
            Err(DirectoryError::UnknownToken(token)) => {
                if !self.directory.is_recently_removed_token(token) {
                    debug!("Room not found for token {} from {}", token, src);
                }
                return Ok(());
            }
            Err(e) => {
                debug!("Datagram from {} rejected: {}", src, e);
                return Ok(());
            }
        };

        match header.msg_type {
            MessageType::SelfQuery => Self::self_reply(sink, header, src),
            MessageType::Launch => self.launch(sink, &room, src, header),
            _ => Ok(()),
        }
    }
}

/// Aux port handler: self-echo for live tokens, nothing else
pub struct AuxHandler {
    directory: Arc<RoomDirectory>,
}

impl AuxHandler {
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self { directory }
    }
}

impl DatagramHandler for AuxHandler {
    fn handle(
        &self,
        sink: &dyn DatagramSink,
        src: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), TransportError> {
        let header = Header::decode(datagram)?;
        if header.msg_type != MessageType::SelfQuery {
            return Ok(());
        }
        if self.directory.room_for_token(header.token).is_none() {
            if !self.directory.is_recently_removed_token(header.token) {
                debug!("Aux Self with unknown token {} from {}", header.token, src);
            }
            return Ok(());
        }
        RoomHandler::self_reply(sink, header, src)
    }
}

/// Both room server ports around one directory
pub struct RoomService {
    handler: Arc<RoomHandler>,
    main: ServerHandle,
    aux: ServerHandle,
}

impl RoomService {
    /// Create a fresh directory and start serving it
    pub fn start(config: RoomConfig) -> Result<Self, ServerError> {
        let directory = Arc::new(RoomDirectory::new(config)?);
        Ok(Self::start_with(directory)?)
    }

    /// Serve an existing directory
    pub fn start_with(directory: Arc<RoomDirectory>) -> std::io::Result<Self> {
        let config = directory.config().clone();
        let handler = Arc::new(RoomHandler::new(directory.clone()));

        let sweeper = directory.clone();
        let resender = handler.clone();
        let broadcaster = handler.clone();
        let main = PollServer::new(
            "room-main",
            SocketAddr::new(config.bind, config.main_port),
            handler.clone(),
        )
        .threads(config.threads)
        .with_fn_task(
            "dead-member-sweep",
            config.dead_member_sweep(),
            TaskScope::Global,
            move |ctx| {
                sweeper.sweep_dead(ctx.now);
                Ok(())
            },
        )
        .with_fn_task(
            "launch-resend",
            config.launch_resend_interval(),
            TaskScope::Global,
            move |ctx| {
                resender.resend_launch_events(ctx.sink, ctx.now);
                Ok(())
            },
        )
        .with_fn_task(
            "room-events",
            Duration::ZERO,
            TaskScope::EveryThread,
            move |ctx| {
                broadcaster.broadcast_room_events(ctx.sink);
                Ok(())
            },
        )
        .start()?;

        let aux = PollServer::new(
            "room-aux",
            SocketAddr::new(config.bind, config.aux_port),
            Arc::new(AuxHandler::new(directory)),
        )
        .start()?;

        info!(
            "Room service up: main {} aux {}",
            main.local_addr(),
            aux.local_addr()
        );
        Ok(Self { handler, main, aux })
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        self.handler.directory()
    }

    pub fn handler(&self) -> &Arc<RoomHandler> {
        &self.handler
    }

    pub fn main_addr(&self) -> SocketAddr {
        self.main.local_addr()
    }

    pub fn aux_addr(&self) -> SocketAddr {
        self.aux.local_addr()
    }

    pub fn shutdown(self) {
        self.main.shutdown();
        self.aux.shutdown();
        info!("Room service stopped");
    }
}
