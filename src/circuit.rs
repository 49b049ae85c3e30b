//! Origin-side circuit table.
//!
//! A circuit is created towards a first hop (CREATE → CREATED) and then grown
//! one hop at a time (EXTEND → EXTENDED) through that first hop. The table
//! holds every circuit this peer originated, in creation order, plus a
//! membership index answering "which of my circuits already contain `p`?".
//!
//! # State Machine
//!
//! ```text
//! NEW ──CREATE──▶ WAIT_CREATED ──CREATED──▶ READY ◀──EXTENDED── EXTENDING
//!                                             └────extend()─────────▲
//! any ──close()──▶ CLOSED
//! ```
//!
//! The table never performs I/O. Operations return the cells to send as
//! [`Outbound`] values and the caller puts them on the wire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cell::{Address, Cell, CircuitId};
use crate::error::{CryptoError, TunnelError};

/// Maximum heartbeat-opened circuits waiting for CREATED from one first hop.
///
/// SECURITY: a peer that never answers CREATE cannot occupy more than this
/// many slots of the circuit limit through repeated introductions.
pub const MAX_WAITING_PER_FIRST_HOP: usize = 2;

/// Draw a circuit identifier from the system CSPRNG.
pub fn generate_circuit_id() -> Result<CircuitId, CryptoError> {
    let mut id = [0u8; 4];
    getrandom::getrandom(&mut id)?;
    Ok(u32::from_be_bytes(id))
}

/// A cell addressed to a neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub cell: Cell,
}

impl Outbound {
    pub fn new(to: SocketAddr, cell: Cell) -> Self {
        Self { to, cell }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    WaitCreated,
    Ready,
    Extending,
    Closed,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::WaitCreated => "WAIT_CREATED",
            CircuitState::Ready => "READY",
            CircuitState::Extending => "EXTENDING",
            CircuitState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: CircuitId,
    pub first_hop: SocketAddr,
    /// Peers joined through EXTENDED, in order. The first hop is not listed.
    pub hops: Vec<SocketAddr>,
    pub created: bool,
    pub pending_extensions: VecDeque<SocketAddr>,
    /// Target of the single outstanding EXTEND, if any.
    pub extending: Option<SocketAddr>,
    pub created_at: Instant,
    closed: bool,
}

impl Circuit {
    fn new(id: CircuitId, first_hop: SocketAddr) -> Self {
        Self {
            id,
            first_hop,
            hops: Vec::new(),
            created: false,
            pending_extensions: VecDeque::new(),
            extending: None,
            created_at: Instant::now(),
            closed: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.closed {
            CircuitState::Closed
        } else if !self.created {
            CircuitState::WaitCreated
        } else if self.extending.is_some() {
            CircuitState::Extending
        } else {
            CircuitState::Ready
        }
    }

    /// Whether DATA may be sent on this circuit.
    pub fn is_ready(&self) -> bool {
        self.created && !self.closed
    }

    /// Every peer on the circuit: first hop followed by joined hops.
    pub fn path(&self) -> Vec<SocketAddr> {
        std::iter::once(self.first_hop)
            .chain(self.hops.iter().copied())
            .collect()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.first_hop == *peer || self.hops.contains(peer)
    }

    /// The exit for this circuit as it currently stands.
    pub fn tail(&self) -> SocketAddr {
        self.hops.last().copied().unwrap_or(self.first_hop)
    }

    fn is_known_target(&self, peer: &SocketAddr) -> bool {
        self.contains(peer)
            || self.extending.as_ref() == Some(peer)
            || self.pending_extensions.contains(peer)
    }

    /// Issue the next queued EXTEND if none is outstanding.
    fn drain_extension(&mut self) -> Option<Outbound> {
        if !self.is_ready() || self.extending.is_some() {
            return None;
        }
        while let Some(target) = self.pending_extensions.pop_front() {
            if self.contains(&target) {
                continue;
            }
            self.extending = Some(target);
            trace!(circuit = self.id, target = %target, "sending EXTEND");
            return Some(Outbound::new(
                self.first_hop,
                Cell::Extend {
                    circuit_id: self.id,
                    target: Address::from(target),
                },
            ));
        }
        None
    }
}

#[derive(Default)]
pub struct CircuitTable {
    circuits: HashMap<CircuitId, Circuit>,
    /// Creation order; ready-circuit selection walks this, never the map.
    order: Vec<CircuitId>,
    membership: HashMap<SocketAddr, HashSet<CircuitId>>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn contains_id(&self, id: CircuitId) -> bool {
        self.circuits.contains_key(&id)
    }

    /// Circuits in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Circuit> {
        self.order.iter().filter_map(|id| self.circuits.get(id))
    }

    /// Circuit ids whose membership includes `peer`.
    pub fn membership(&self, peer: &SocketAddr) -> Option<&HashSet<CircuitId>> {
        self.membership.get(peer).filter(|ids| !ids.is_empty())
    }

    pub fn is_member(&self, peer: &SocketAddr) -> bool {
        self.membership(peer).is_some()
    }

    /// Open a new circuit towards `first_hop`. The returned cell is the
    /// CREATE to send.
    pub fn create(&mut self, first_hop: SocketAddr) -> Result<(CircuitId, Outbound), CryptoError> {
        let id = loop {
            let candidate = generate_circuit_id()?;
            if !self.circuits.contains_key(&candidate) {
                break candidate;
            }
        };
        self.circuits.insert(id, Circuit::new(id, first_hop));
        self.order.push(id);
        debug!(circuit = id, first_hop = %first_hop, "circuit created, awaiting CREATED");
        Ok((id, Outbound::new(first_hop, Cell::Create { circuit_id: id })))
    }

    /// First hop answered our CREATE.
    pub fn on_created(
        &mut self,
        from: SocketAddr,
        id: CircuitId,
    ) -> Result<Option<Outbound>, TunnelError> {
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or(TunnelError::UnknownCircuit(id))?;
        if circuit.first_hop != from {
            return Err(TunnelError::ProtocolViolation("CREATED from a peer other than the first hop"));
        }
        if circuit.created {
            return Err(TunnelError::ProtocolViolation("duplicate CREATED"));
        }
        circuit.created = true;
        let next = circuit.drain_extension();
        self.membership.entry(from).or_default().insert(id);
        debug!(circuit = id, first_hop = %from, "circuit ready");
        Ok(next)
    }

    /// Queue `target` for extension. Returns the EXTEND to send if it can be
    /// issued right away. Targets already on the path, queued or in flight
    /// are ignored.
    pub fn extend(
        &mut self,
        id: CircuitId,
        target: SocketAddr,
    ) -> Result<Option<Outbound>, TunnelError> {
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or(TunnelError::UnknownCircuit(id))?;
        if circuit.is_known_target(&target) {
            return Ok(None);
        }
        circuit.pending_extensions.push_back(target);
        Ok(circuit.drain_extension())
    }

    /// The tail reported that `joined` is now part of the circuit.
    ///
    /// An EXTENDED repeating the current tail hop is tolerated and changes
    /// nothing.
    pub fn on_extended(
        &mut self,
        from: SocketAddr,
        id: CircuitId,
        joined: SocketAddr,
    ) -> Result<Option<Outbound>, TunnelError> {
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or(TunnelError::UnknownCircuit(id))?;
        if circuit.first_hop != from {
            return Err(TunnelError::ProtocolViolation("EXTENDED from a peer other than the first hop"));
        }
        if circuit.hops.last() == Some(&joined) {
            trace!(circuit = id, hop = %joined, "duplicate EXTENDED ignored");
            return Ok(None);
        }
        if circuit.extending.is_none() {
            return Err(TunnelError::ProtocolViolation("EXTENDED without an outstanding EXTEND"));
        }

        circuit.extending = None;
        circuit.hops.push(joined);
        let next = circuit.drain_extension();
        let len = circuit.hops.len() + 1;
        self.membership.entry(joined).or_default().insert(id);
        debug!(circuit = id, hop = %joined, len, "circuit extended");
        Ok(next)
    }

    /// Heartbeat policy for a live peer.
    ///
    /// 1. If `peer` belongs to no circuit, open a circuit with it as first
    ///    hop (unless `max_circuits` are already open). Membership is only
    ///    recorded on CREATED, so repeated heartbeats fan out new circuits
    ///    while earlier ones are still waiting, up to
    ///    [`MAX_WAITING_PER_FIRST_HOP`] per first hop.
    /// 2. Queue `peer` on every circuit that does not yet contain it.
    pub fn on_heartbeat(
        &mut self,
        peer: SocketAddr,
        max_circuits: usize,
    ) -> Result<Vec<Outbound>, CryptoError> {
        let mut out = Vec::new();

        if !self.is_member(&peer)
            && self.circuits.len() < max_circuits
            && self.waiting_on(&peer) < MAX_WAITING_PER_FIRST_HOP
        {
            let (_, create) = self.create(peer)?;
            out.push(create);
        }

        for id in &self.order {
            let Some(circuit) = self.circuits.get_mut(id) else {
                continue;
            };
            if circuit.is_known_target(&peer) {
                continue;
            }
            circuit.pending_extensions.push_back(peer);
            if let Some(extend) = circuit.drain_extension() {
                out.push(extend);
            }
        }
        Ok(out)
    }

    /// Remove a circuit and its membership entries.
    pub fn close(&mut self, id: CircuitId) -> Option<Circuit> {
        let mut circuit = self.circuits.remove(&id)?;
        self.order.retain(|c| *c != id);
        for peer in circuit.path() {
            if let Some(ids) = self.membership.get_mut(&peer) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.membership.remove(&peer);
                }
            }
        }
        circuit.closed = true;
        debug!(circuit = id, hops = circuit.hops.len(), "circuit closed");
        Some(circuit)
    }

    /// Abandon every circuit whose first hop is `peer`.
    pub fn close_first_hop(&mut self, peer: SocketAddr) -> Vec<Circuit> {
        let ids: Vec<CircuitId> = self
            .iter()
            .filter(|c| c.first_hop == peer)
            .map(|c| c.id)
            .collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    /// Circuits to `first_hop` still waiting for CREATED.
    pub fn waiting_on(&self, first_hop: &SocketAddr) -> usize {
        self.circuits
            .values()
            .filter(|c| c.first_hop == *first_hop && !c.created)
            .count()
    }

    /// Close circuits that have waited longer than `timeout` for CREATED.
    pub fn expire_waiting(&mut self, timeout: Duration) -> Vec<Circuit> {
        self.expire_waiting_at(Instant::now(), timeout)
    }

    pub fn expire_waiting_at(&mut self, now: Instant, timeout: Duration) -> Vec<Circuit> {
        let ids: Vec<CircuitId> = self
            .iter()
            .filter(|c| !c.created && now.saturating_duration_since(c.created_at) > timeout)
            .map(|c| c.id)
            .collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    /// Drop `peer` from every pending extension queue.
    pub fn forget_peer(&mut self, peer: &SocketAddr) {
        for circuit in self.circuits.values_mut() {
            circuit.pending_extensions.retain(|p| p != peer);
        }
    }

    /// First ready circuit in creation order.
    pub fn select_ready(&self) -> Option<CircuitId> {
        self.iter().find(|c| c.is_ready()).map(|c| c.id)
    }

    pub fn ready_count(&self) -> usize {
        self.circuits.values().filter(|c| c.is_ready()).count()
    }

    /// Close everything, e.g. on shutdown.
    pub fn clear(&mut self) -> usize {
        let n = self.circuits.len();
        self.circuits.clear();
        self.order.clear();
        self.membership.clear();
        n
    }
}
