//! Relay table for intermediate and tail hops.
//!
//! A hop is identified by the neighbor it talks to and the circuit id, so a
//! peer relaying circuit `c` between `a` and `b` holds two mirror entries:
//!
//! ```text
//! forward[(a, c)]  = (b, c)     origin side → exit side
//! backward[(b, c)] = (a, c)     exit side   → origin side
//! ```
//!
//! Circuit ids are never rewritten between hops. Both mirrors are installed
//! and removed together.
//!
//! The table also records every `(neighbor, c)` for which this peer answered
//! a CREATE. A record without a forward binding marks this peer as the tail
//! of that circuit.
//!
//! Bindings and tail records carry the time of their last traffic and are
//! expired once idle, since the neighbor that created them may never be
//! seen as a candidate and so never pruned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cell::CircuitId;
use crate::error::TunnelError;

/// Maximum relay bindings (forward entries) this peer will hold.
/// SECURITY: Prevents memory exhaustion from EXTEND floods.
pub const MAX_RELAY_BINDINGS: usize = 10_000;

/// Maximum accepted CREATE records.
/// SECURITY: Bounds the tail table against CREATE floods.
pub const MAX_ACCEPTED_CIRCUITS: usize = 20_000;

/// A circuit as seen by one hop: the neighbor and the circuit id.
pub type HopKey = (SocketAddr, CircuitId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the exit.
    Forward,
    /// Towards the origin.
    Backward,
}

#[derive(Debug, Clone)]
pub struct RelayBinding {
    pub to: HopKey,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub packets_relayed: u64,
    pub bytes_relayed: u64,
}

impl RelayBinding {
    fn new(to: HopKey) -> Self {
        let now = Instant::now();
        Self {
            to,
            created_at: now,
            last_activity: now,
            packets_relayed: 0,
            bytes_relayed: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn record_activity(&mut self, bytes: usize) {
        self.last_activity = Instant::now();
        self.bytes_relayed += bytes as u64;
        self.packets_relayed += 1;
    }
}

/// What was torn down when a neighbor went away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NeighborLoss {
    /// Removed `(origin side, exit side)` binding pairs.
    pub bindings: Vec<(HopKey, HopKey)>,
    /// Removed accepted-CREATE records.
    pub accepted: Vec<HopKey>,
}

impl NeighborLoss {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.accepted.is_empty()
    }
}

#[derive(Default)]
pub struct RelayTable {
    forward: HashMap<HopKey, RelayBinding>,
    backward: HashMap<HopKey, HopKey>,
    /// Accepted CREATEs and when traffic last used them.
    accepted: HashMap<HopKey, Instant>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this peer answered CREATE(`id`) from `from`.
    pub fn accept(&mut self, from: SocketAddr, id: CircuitId) -> Result<(), TunnelError> {
        let key = (from, id);
        if !self.accepted.contains_key(&key) && self.accepted.len() >= MAX_ACCEPTED_CIRCUITS {
            return Err(TunnelError::ProtocolViolation("accepted circuit table full"));
        }
        self.accepted.insert(key, Instant::now());
        trace!(neighbor = %from, circuit = id, "accepted CREATE");
        Ok(())
    }

    pub fn is_accepted(&self, from: SocketAddr, id: CircuitId) -> bool {
        self.accepted.contains_key(&(from, id))
    }

    /// Refresh an accepted record on tail traffic.
    pub fn touch_accepted(&mut self, from: SocketAddr, id: CircuitId) {
        if let Some(seen) = self.accepted.get_mut(&(from, id)) {
            *seen = Instant::now();
        }
    }

    /// Accepted and not forwarding anywhere: this peer is the exit.
    pub fn is_tail(&self, from: SocketAddr, id: CircuitId) -> bool {
        let key = (from, id);
        self.accepted.contains_key(&key) && !self.forward.contains_key(&key)
    }

    /// Install the mirror pair `(from, id) ↔ (to, id)`.
    pub fn install(&mut self, from: SocketAddr, to: SocketAddr, id: CircuitId) -> Result<(), TunnelError> {
        let from_key = (from, id);
        let to_key = (to, id);
        if from == to {
            return Err(TunnelError::ProtocolViolation("relay binding loops back to its sender"));
        }
        if self.forward.contains_key(&from_key)
            || self.backward.contains_key(&from_key)
            || self.forward.contains_key(&to_key)
            || self.backward.contains_key(&to_key)
        {
            return Err(TunnelError::ProtocolViolation("relay binding already exists"));
        }
        if self.forward.len() >= MAX_RELAY_BINDINGS {
            return Err(TunnelError::ProtocolViolation("relay table full"));
        }
        self.forward.insert(from_key, RelayBinding::new(to_key));
        self.backward.insert(to_key, from_key);
        debug!(circuit = id, from = %from, to = %to, "relay binding installed");
        Ok(())
    }

    pub fn lookup_forward(&self, from: SocketAddr, id: CircuitId) -> Option<HopKey> {
        self.forward.get(&(from, id)).map(|b| b.to)
    }

    pub fn lookup_backward(&self, to: SocketAddr, id: CircuitId) -> Option<HopKey> {
        self.backward.get(&(to, id)).copied()
    }

    /// Where a cell entering on `(from, id)` leaves, and in which direction.
    pub fn route(&self, from: SocketAddr, id: CircuitId) -> Option<(HopKey, Direction)> {
        if let Some(to) = self.lookup_forward(from, id) {
            return Some((to, Direction::Forward));
        }
        self.lookup_backward(from, id).map(|to| (to, Direction::Backward))
    }

    pub fn binding(&self, from: SocketAddr, id: CircuitId) -> Option<&RelayBinding> {
        self.forward.get(&(from, id))
    }

    /// Count a relayed cell against the binding that `(neighbor, id)` belongs
    /// to, whichever side it is.
    pub fn record_activity(&mut self, neighbor: SocketAddr, id: CircuitId, bytes: usize) {
        let key = (neighbor, id);
        let origin_side = match self.backward.get(&key) {
            Some(from) => *from,
            None => key,
        };
        if let Some(binding) = self.forward.get_mut(&origin_side) {
            binding.record_activity(bytes);
        }
        self.touch_accepted(origin_side.0, origin_side.1);
    }

    /// Tear down the binding pair `key` belongs to (either side), along with
    /// the accepted record on its origin side. Returns the removed pair.
    pub fn remove(&mut self, neighbor: SocketAddr, id: CircuitId) -> Option<(HopKey, HopKey)> {
        let key = (neighbor, id);
        let from_key = if self.forward.contains_key(&key) {
            key
        } else {
            *self.backward.get(&key)?
        };
        let binding = self.forward.remove(&from_key)?;
        self.backward.remove(&binding.to);
        self.accepted.remove(&from_key);
        debug!(
            circuit = id,
            from = %from_key.0,
            to = %binding.to.0,
            packets = binding.packets_relayed,
            bytes = binding.bytes_relayed,
            age_ms = binding.age().as_millis() as u64,
            "relay binding removed"
        );
        Some((from_key, binding.to))
    }

    /// Remove bindings and tail records with no traffic for `window`.
    pub fn expire_idle(&mut self, window: Duration) -> NeighborLoss {
        self.expire_idle_at(Instant::now(), window)
    }

    pub fn expire_idle_at(&mut self, now: Instant, window: Duration) -> NeighborLoss {
        let mut loss = NeighborLoss::default();

        let idle: Vec<HopKey> = self
            .forward
            .iter()
            .filter(|(_, binding)| binding.idle_at(now) > window)
            .map(|(from, _)| *from)
            .collect();
        for (from, id) in idle {
            if let Some(pair) = self.remove(from, id) {
                loss.bindings.push(pair);
                loss.accepted.push(pair.0);
            }
        }

        let quiet: Vec<HopKey> = self
            .accepted
            .iter()
            .filter(|(key, seen)| {
                !self.forward.contains_key(*key) && now.saturating_duration_since(**seen) > window
            })
            .map(|(key, _)| *key)
            .collect();
        for key in quiet {
            self.accepted.remove(&key);
            loss.accepted.push(key);
        }

        if !loss.is_empty() {
            debug!(
                bindings = loss.bindings.len(),
                accepted = loss.accepted.len(),
                "idle relay state expired"
            );
        }
        loss
    }

    /// Remove every binding and accepted record touching `peer`.
    pub fn remove_neighbor(&mut self, peer: SocketAddr) -> NeighborLoss {
        let mut loss = NeighborLoss::default();

        let touching: Vec<HopKey> = self
            .forward
            .iter()
            .filter(|(from, binding)| from.0 == peer || binding.to.0 == peer)
            .map(|(from, _)| *from)
            .collect();
        for (from, id) in touching {
            if let Some(pair) = self.remove(from, id) {
                loss.bindings.push(pair);
                loss.accepted.push(pair.0);
            }
        }

        let orphaned: Vec<HopKey> = self
            .accepted
            .keys()
            .filter(|(from, _)| *from == peer)
            .copied()
            .collect();
        for key in orphaned {
            self.accepted.remove(&key);
            loss.accepted.push(key);
        }

        if !loss.is_empty() {
            debug!(
                peer = %peer,
                bindings = loss.bindings.len(),
                accepted = loss.accepted.len(),
                "neighbor lost, relay state torn down"
            );
        }
        loss
    }

    pub fn binding_count(&self) -> usize {
        self.forward.len()
    }

    pub fn tail_count(&self) -> usize {
        self.accepted
            .keys()
            .filter(|key| !self.forward.contains_key(*key))
            .count()
    }

    /// Check the mirror property over the whole table.
    pub fn is_symmetric(&self) -> bool {
        self.forward.len() == self.backward.len()
            && self
                .forward
                .iter()
                .all(|(from, b)| self.backward.get(&b.to) == Some(from))
    }
}
