//! Short-lived memory of removed keys
//!
//! Tokens and room ids stay "recently removed" for a while after their
//! owner is gone, so late datagrams addressed to them are dropped quietly
//! instead of being logged as unknown.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Default time a removed key is remembered
pub const RECENT_LIFETIME: Duration = Duration::from_secs(30);

/// Default interval between prune passes
pub const RECENT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct RecentList<K: Eq + Hash> {
    entries: DashMap<K, Instant>,
    lifetime: Duration,
    check_interval: Duration,
    last_prune: Mutex<Instant>,
}

impl<K: Eq + Hash + Copy> RecentList<K> {
    pub fn new(check_interval: Duration, lifetime: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            lifetime,
            check_interval,
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Remember `key` as removed at `now`.
    ///
    /// Expired entries are pruned opportunistically; a caller that finds
    /// another thread already pruning skips it.
    pub fn add(&self, key: K, now: Instant) {
        self.entries.insert(key, now);

        if let Some(mut last) = self.last_prune.try_lock() {
            if now.saturating_duration_since(*last) >= self.check_interval {
                *last = now;
                drop(last);
                self.prune(now);
            }
        }
    }

    /// Whether `key` was removed within the lifetime window
    pub fn contains(&self, key: &K, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|at| now.saturating_duration_since(*at) <= self.lifetime)
            .unwrap_or(false)
    }

    pub fn prune(&self, now: Instant) {
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) <= lifetime);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for RecentList<K> {
    fn default() -> Self {
        Self::new(RECENT_CHECK_INTERVAL, RECENT_LIFETIME)
    }
}
