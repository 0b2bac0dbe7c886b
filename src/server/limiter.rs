//! Connection caps, global and per peer address.
//!
//! A granted connection holds a [`ConnectionSlot`]; dropping it gives the
//! slot back, so however a session ends the counters move exactly once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_peer: HashMap<IpAddr, usize>,
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    TooManyConnections,
    TooManyFromPeer,
}

#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_peer: usize,
    counts: Arc<Mutex<Counts>>,
}

impl ConnectionLimiter {
    /// Caps of 0 mean unlimited.
    pub fn new(max_total: usize, max_per_peer: usize) -> Self {
        Self {
            max_total,
            max_per_peer,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Reserve a slot for a connection from `peer`.
    pub fn try_acquire(&self, peer: IpAddr) -> Result<ConnectionSlot, Refusal> {
        let mut counts = self.counts.lock();
        if self.max_total > 0 && counts.total >= self.max_total {
            warn!(%peer, total = counts.total, "connection refused: server full");
            return Err(Refusal::TooManyConnections);
        }
        let from_peer = counts.per_peer.get(&peer).copied().unwrap_or(0);
        if self.max_per_peer > 0 && from_peer >= self.max_per_peer {
            warn!(%peer, from_peer, "connection refused: too many from peer");
            return Err(Refusal::TooManyFromPeer);
        }
        counts.total += 1;
        *counts.per_peer.entry(peer).or_insert(0) += 1;
        trace!(%peer, total = counts.total, "connection slot acquired");
        Ok(ConnectionSlot {
            peer,
            counts: Arc::clone(&self.counts),
        })
    }

    /// Connections currently holding a slot.
    pub fn active(&self) -> usize {
        self.counts.lock().total
    }

    pub fn active_from(&self, peer: IpAddr) -> usize {
        self.counts.lock().per_peer.get(&peer).copied().unwrap_or(0)
    }
}

/// A granted connection; the slot is released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    peer: IpAddr,
    counts: Arc<Mutex<Counts>>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_peer.get_mut(&self.peer) {
            *n -= 1;
            if *n == 0 {
                counts.per_peer.remove(&self.peer);
            }
        }
    }
}
