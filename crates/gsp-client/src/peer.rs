//! Per-peer ping bookkeeping
//!
//! A [`Peer`] decides when the next Ping goes out and folds the matching
//! Acks into loss and round-trip statistics. It never touches a socket and
//! takes the current time as a parameter, so the endpoint loop drives it
//! and tests can step through time explicitly.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use gsp_core::config::ClientConfig;

/// Rescale the sliding counters once their sum passes this
const WINDOW: u32 = 200;

/// Samples needed before connectivity is reported
const MIN_SAMPLES: u32 = 2;

/// Weight of the running average when folding in a new RTT sample
const RTT_KEEP: f32 = 0.8;

/// Ping pacing
#[derive(Debug, Clone, Copy)]
pub struct PingTimings {
    /// Delay before the next ping once the previous one was answered
    pub interval: Duration,
    /// Delay before an unanswered ping is repeated
    pub repeat: Duration,
    /// An unanswered sequence is abandoned after this
    pub give_up: Duration,
}

impl From<&ClientConfig> for PingTimings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            interval: config.ping_interval(),
            repeat: config.ping_repeat(),
            give_up: config.ping_give_up(),
        }
    }
}

impl Default for PingTimings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// Roster entry handed to the endpoint by the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub endpoint: SocketAddr,
    pub can_relay: bool,
    pub is_relay: bool,
}

/// Point-in-time view of a peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    pub name: String,
    pub endpoint: SocketAddr,
    pub can_relay: bool,
    pub is_relay: bool,
    /// Accepted share of recent pings, 0.0 to 1.0
    pub connectivity: f32,
    /// Smoothed round trip in milliseconds
    pub average_rtt_ms: f32,
    /// Both directions have seen traffic
    pub connected: bool,
    pub pings_sent: u64,
    pub pings_received: u64,
    pub acks_received: u64,
}

/// Ping state for one remote member
#[derive(Debug, Clone)]
pub struct Peer {
    name: String,
    endpoint: SocketAddr,
    can_relay: bool,
    is_relay: bool,

    seq: u16,
    answered: bool,
    repeat: u32,
    first_send: Option<Instant>,
    last_send: Option<Instant>,

    recent_ok: u32,
    recent_lost: u32,
    average_rtt_ms: f32,

    pings_sent: u64,
    pings_received: u64,
    acks_received: u64,
}

impl Peer {
    pub fn new(entry: &RosterEntry) -> Self {
        Self {
            name: entry.name.clone(),
            endpoint: entry.endpoint,
            can_relay: entry.can_relay,
            is_relay: entry.is_relay,
            seq: 0,
            answered: true,
            repeat: 0,
            first_send: None,
            last_send: None,
            recent_ok: 0,
            recent_lost: 0,
            average_rtt_ms: 0.0,
            pings_sent: 0,
            pings_received: 0,
            acks_received: 0,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take over name and relay flags from a fresh roster entry
    pub fn update(&mut self, entry: &RosterEntry) {
        self.name.clone_from(&entry.name);
        self.can_relay = entry.can_relay;
        self.is_relay = entry.is_relay;
    }

    /// Sequence to ping with now, if a ping is due.
    ///
    /// `next_seq` is only called when a new sequence starts; repeats reuse
    /// the outstanding one. The give-up time counts from the first send of
    /// a sequence, so repeats do not keep it alive.
    pub fn poll_ping(
        &mut self,
        now: Instant,
        timings: &PingTimings,
        next_seq: impl FnOnce() -> u16,
    ) -> Option<u16> {
        let since = self.last_send.map(|at| now.saturating_duration_since(at));

        let (due, fresh) = if self.answered {
            (since.map_or(true, |s| s >= timings.interval), true)
        } else {
            let age = self
                .first_send
                .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
            if age > timings.give_up {
                self.record(false);
                (true, true)
            } else {
                (since.map_or(true, |s| s >= timings.repeat), false)
            }
        };
        if !due {
            return None;
        }

        if fresh {
            self.seq = next_seq();
            self.repeat = 0;
            self.first_send = Some(now);
            self.pings_sent += 1;
        } else {
            self.repeat += 1;
        }
        self.answered = false;
        self.last_send = Some(now);
        Some(self.seq)
    }

    /// Ack for `seq` arrived. Returns false for stale or duplicate acks.
    pub fn on_ack(&mut self, seq: u16, now: Instant) -> bool {
        if self.answered || seq != self.seq {
            return false;
        }
        self.answered = true;
        self.acks_received += 1;
        self.record(true);

        // A repeated ping cannot be matched to one send time
        if self.repeat == 0 {
            if let Some(sent) = self.last_send {
                let sample = now.saturating_duration_since(sent).as_secs_f32() * 1000.0;
                self.average_rtt_ms = if self.pings_sent < 2 {
                    sample
                } else {
                    self.average_rtt_ms * RTT_KEEP + sample * (1.0 - RTT_KEEP)
                };
            }
        }
        true
    }

    /// The peer pinged us
    pub fn on_ping(&mut self) {
        self.pings_received += 1;
    }

    fn record(&mut self, accepted: bool) {
        if accepted {
            self.recent_ok += 1;
        } else {
            self.recent_lost += 1;
        }
        if self.recent_ok + self.recent_lost > WINDOW {
            self.recent_lost >>= 2;
            self.recent_ok >>= 1;
        }
    }

    pub fn connectivity(&self) -> f32 {
        let samples = self.recent_ok + self.recent_lost;
        if samples < MIN_SAMPLES {
            return 0.0;
        }
        self.recent_ok as f32 / samples as f32
    }

    pub fn average_rtt_ms(&self) -> f32 {
        self.average_rtt_ms
    }

    pub fn is_connected(&self) -> bool {
        self.pings_received >= MIN_SAMPLES as u64 && self.acks_received >= MIN_SAMPLES as u64
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            name: self.name.clone(),
            endpoint: self.endpoint,
            can_relay: self.can_relay,
            is_relay: self.is_relay,
            connectivity: self.connectivity(),
            average_rtt_ms: self.average_rtt_ms,
            connected: self.is_connected(),
            pings_sent: self.pings_sent,
            pings_received: self.pings_received,
            acks_received: self.acks_received,
        }
    }
}
