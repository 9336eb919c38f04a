//! # Peer Store
//!
//! Ordered list of connected validators plus their measured latency.
//!
//! Forwarding iterates a [`PeerStore::snapshot`] taken under the lock and
//! released before any I/O. Peers appear in the order they first connected;
//! a peer reached both inbound and outbound is listed once.
//!
//! ## Retention
//!
//! | Policy | On last connection closed |
//! |--------|---------------------------|
//! | [`PeerRetention::PruneOnDisconnect`] | entry removed |
//! | [`PeerRetention::Retain`] | entry kept without a live connection |
//!
//! With `Retain` the forwarding list only grows; a dead entry counts as a
//! failed delivery on every fan-out.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use quinn::Connection;
use tracing::debug;

use crate::identity::Identity;

/// Peers with latency samples kept at once.
const MAX_LATENCY_ENTRIES: usize = 1024;

/// Weight of a new RTT sample in the smoothed latency.
const LATENCY_EWMA_ALPHA: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PeerRetention {
    #[default]
    PruneOnDisconnect,
    Retain,
}

/// Snapshot of one peer, safe to use without the store's lock.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub identity: Identity,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    /// First live connection, if any.
    pub connection: Option<Connection>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyStats {
    pub last: Duration,
    pub smoothed: Duration,
    pub samples: u64,
}

impl LatencyStats {
    fn first(rtt: Duration) -> Self {
        Self {
            last: rtt,
            smoothed: rtt,
            samples: 1,
        }
    }

    fn record(&mut self, rtt: Duration) {
        let smoothed = self.smoothed.as_secs_f64() * (1.0 - LATENCY_EWMA_ALPHA)
            + rtt.as_secs_f64() * LATENCY_EWMA_ALPHA;
        self.smoothed = Duration::from_secs_f64(smoothed);
        self.last = rtt;
        self.samples += 1;
    }
}

struct PeerEntry {
    identity: Identity,
    remote_addr: SocketAddr,
    direction: Direction,
    connections: Vec<Connection>,
}

impl PeerEntry {
    fn live_connection(&self) -> Option<&Connection> {
        self.connections.iter().find(|c| c.close_reason().is_none())
    }
}

pub struct PeerStore {
    retention: PeerRetention,
    peers: Mutex<Vec<PeerEntry>>,
    latency: Mutex<LruCache<Identity, LatencyStats>>,
}

impl PeerStore {
    pub fn new(retention: PeerRetention) -> Self {
        let cap = NonZeroUsize::new(MAX_LATENCY_ENTRIES).expect("latency capacity must be non-zero");
        Self {
            retention,
            peers: Mutex::new(Vec::new()),
            latency: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn retention(&self) -> PeerRetention {
        self.retention
    }

    fn peers(&self) -> MutexGuard<'_, Vec<PeerEntry>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track `connection` for `identity`. Returns `true` if the peer is new.
    pub fn add(
        &self,
        identity: Identity,
        remote_addr: SocketAddr,
        direction: Direction,
        connection: Connection,
    ) -> bool {
        let mut peers = self.peers();
        if let Some(entry) = peers.iter_mut().find(|e| e.identity == identity) {
            let stable_id = connection.stable_id();
            if !entry.connections.iter().any(|c| c.stable_id() == stable_id) {
                entry.connections.push(connection);
            }
            if direction == Direction::Outbound {
                entry.remote_addr = remote_addr;
                entry.direction = direction;
            }
            return false;
        }
        peers.push(PeerEntry {
            identity,
            remote_addr,
            direction,
            connections: vec![connection],
        });
        true
    }

    /// Forget one closed connection. Returns `true` if the peer was removed.
    pub fn remove_connection(&self, identity: &Identity, stable_id: usize) -> bool {
        let mut peers = self.peers();
        let Some(pos) = peers.iter().position(|e| e.identity == *identity) else {
            return false;
        };
        peers[pos].connections.retain(|c| c.stable_id() != stable_id);
        if peers[pos].connections.is_empty() && self.retention == PeerRetention::PruneOnDisconnect {
            peers.remove(pos);
            debug!(peer = %identity.short(), "peer pruned after disconnect");
            return true;
        }
        false
    }

    pub fn connection(&self, identity: &Identity) -> Option<Connection> {
        self.peers()
            .iter()
            .find(|e| e.identity == *identity)
            .and_then(|e| e.live_connection().cloned())
    }

    pub fn snapshot(&self) -> Vec<PeerHandle> {
        self.peers()
            .iter()
            .map(|e| PeerHandle {
                identity: e.identity,
                remote_addr: e.remote_addr,
                direction: e.direction,
                connection: e.live_connection().cloned(),
            })
            .collect()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.peers().iter().map(|e| e.identity).collect()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.peers().iter().any(|e| e.identity == *identity)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    pub fn record_latency(&self, identity: Identity, rtt: Duration) {
        let mut latency = self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match latency.get_mut(&identity) {
            Some(stats) => stats.record(rtt),
            None => {
                latency.put(identity, LatencyStats::first(rtt));
            }
        }
    }

    pub fn latency(&self, identity: &Identity) -> Option<LatencyStats> {
        self.latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .peek(identity)
            .copied()
    }
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore")
            .field("retention", &self.retention)
            .field("peers", &self.len())
            .finish()
    }
}
