//! Tunnel core with actor-based architecture.
//!
//! The core is the single mutator of all tunnel state: the candidate pool,
//! the origin-side circuit table, the relay table and the exit engine. Every
//! other task (overlay receive loop, SOCKS5 associations, exit sockets) talks
//! to it through bounded queues.
//!
//! # Architecture
//!
//! - `TunnelCore`: the public handle (cheap to clone, posts commands)
//! - `TunnelActor`: owns all state, processes one command at a time
//! - `TunnelCommand`: commands sent from handles to the actor
//!
//! # Cell Dispatch
//!
//! A cell from neighbor `n` on circuit `c` is resolved to exactly one role:
//!
//! 1. origin: a local circuit `c` whose first hop is `n`;
//! 2. relay: a binding keyed on `(n, c)` in either direction;
//! 3. tail: an accepted CREATE from `(n, c)` with no binding;
//!
//! and otherwise dropped as an unknown circuit (CREATE is the one cell that
//! establishes a role instead of requiring one).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidatePool, DEFAULT_CANDIDATE_FRESHNESS};
use crate::cell::{Address, Cell, CircuitId};
use crate::circuit::{Circuit, CircuitState, CircuitTable, Outbound};
use crate::error::TunnelError;
use crate::exit::{ExitDatagram, ExitEngine};
use crate::protocols::CellTransport;
use crate::relay::RelayTable;


// ============================================================================
// Configuration
// ============================================================================

/// Default capacity of the actor's command queue.
pub const DEFAULT_COMMAND_QUEUE: usize = 1_024;

/// Default capacity of the local delivery channel.
pub const DEFAULT_DELIVERY_QUEUE: usize = 256;

/// Capacity of the queue exit sockets post replies on.
pub const EXIT_RETURN_QUEUE: usize = 256;

/// Default limit on circuits this peer originates.
/// SECURITY: Heartbeats create circuits; bounds the table under churn.
pub const DEFAULT_MAX_CIRCUITS: usize = 256;

/// How often stale candidates are pruned and their state torn down.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// How long an originated circuit may wait for CREATED.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay bindings, tail records and exit sockets without traffic for this
/// long are expired on the prune tick.
/// SECURITY: CREATE from a neighbor that never introduces itself would
/// otherwise hold tail state and an exit socket forever.
pub const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Whether this peer forwards tail DATA to external destinations.
    pub exit_enabled: bool,
    /// Address exit sockets bind to (port 0 = ephemeral).
    pub exit_bind_addr: SocketAddr,
    pub candidate_freshness: Duration,
    pub prune_interval: Duration,
    pub create_timeout: Duration,
    pub relay_idle_timeout: Duration,
    pub command_queue: usize,
    pub delivery_queue: usize,
    pub max_circuits: usize,
    /// Build and extend circuits from heartbeats.
    pub auto_circuits: bool,
    /// Directory peers: walked, never used as hops.
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            exit_enabled: true,
            exit_bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            candidate_freshness: DEFAULT_CANDIDATE_FRESHNESS,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            relay_idle_timeout: DEFAULT_RELAY_IDLE_TIMEOUT,
            command_queue: DEFAULT_COMMAND_QUEUE,
            delivery_queue: DEFAULT_DELIVERY_QUEUE,
            max_circuits: DEFAULT_MAX_CIRCUITS,
            auto_circuits: true,
            bootstrap: Vec::new(),
        }
    }
}


// ============================================================================
// Public Types
// ============================================================================

/// A datagram that reached this peer through the tunnel and is meant for the
/// local application (origin replies, or tail DATA addressed to us).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub circuit_id: CircuitId,
    /// Neighbor the cell arrived from.
    pub from: SocketAddr,
    pub destination: Option<Address>,
    /// External source of reply traffic.
    pub origin: Option<Address>,
    pub payload: Vec<u8>,
}

/// Read-only view of an origin circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    pub id: CircuitId,
    pub first_hop: SocketAddr,
    pub hops: Vec<SocketAddr>,
    pub state: CircuitState,
    pub pending_extensions: usize,
}

impl CircuitInfo {
    pub fn path(&self) -> Vec<SocketAddr> {
        std::iter::once(self.first_hop).chain(self.hops.iter().copied()).collect()
    }
}

impl From<&Circuit> for CircuitInfo {
    fn from(circuit: &Circuit) -> Self {
        Self {
            id: circuit.id,
            first_hop: circuit.first_hop,
            hops: circuit.hops.clone(),
            state: circuit.state(),
            pending_extensions: circuit.pending_extensions.len(),
        }
    }
}

/// Counters and gauges exposed for telemetry and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub cells_received: u64,
    pub cells_sent: u64,
    pub bad_frame: u64,
    pub unknown_circuit: u64,
    pub protocol_violation: u64,
    pub no_route: u64,
    pub transient_io: u64,
    /// EXTEND at a tail naming a peer that is not a live candidate.
    pub extend_target_dropped: u64,
    pub data_relayed: u64,
    pub data_exited: u64,
    pub data_delivered: u64,
    pub exit_replies: u64,
    pub circuits: usize,
    pub ready_circuits: usize,
    pub relay_bindings: usize,
    pub tail_circuits: usize,
    pub exit_sockets: usize,
    pub exit_sockets_opened: u64,
    pub candidates: usize,
}


// ============================================================================
// Commands
// ============================================================================

enum TunnelCommand {
    HandleCell {
        from: SocketAddr,
        data: Vec<u8>,
    },
    Introduction {
        peer: SocketAddr,
    },
    CreateCircuit {
        first_hop: SocketAddr,
        reply: oneshot::Sender<Result<CircuitId, TunnelError>>,
    },
    Extend {
        circuit_id: CircuitId,
        target: SocketAddr,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
    SendData {
        payload: Vec<u8>,
        destination: Option<Address>,
        circuit_id: Option<CircuitId>,
        origin: Option<Address>,
        reply: oneshot::Sender<Result<CircuitId, TunnelError>>,
    },
    Circuit {
        circuit_id: CircuitId,
        reply: oneshot::Sender<Option<CircuitInfo>>,
    },
    Circuits {
        reply: oneshot::Sender<Vec<CircuitInfo>>,
    },
    Candidates {
        reply: oneshot::Sender<Vec<Candidate>>,
    },
    RandomCandidate {
        exclude: Option<SocketAddr>,
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    BootstrapPeers {
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Prune {
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Stats {
        reply: oneshot::Sender<TunnelStats>,
    },
    Fatal {
        reason: String,
    },
    Quit,
}


// ============================================================================
// TunnelCore Handle (public API - cheap to clone)
// ============================================================================

fn actor_closed() -> TunnelError {
    TunnelError::Fatal("tunnel actor closed".to_string())
}

/// Handle to the tunnel actor. Cheap to clone.
#[derive(Clone)]
pub struct TunnelCore {
    cmd_tx: mpsc::Sender<TunnelCommand>,
    ready_rx: watch::Receiver<usize>,
    local_addr: SocketAddr,
}

impl TunnelCore {
    /// Spawn the actor. `local_addr` is this peer's overlay address; cells are
    /// sent through `transport`. Returns the handle and the channel local
    /// deliveries arrive on.
    pub fn spawn(
        local_addr: SocketAddr,
        config: TunnelConfig,
        transport: Arc<dyn CellTransport>,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue.max(1));
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_queue.max(1));
        let (returns_tx, returns_rx) = mpsc::channel(EXIT_RETURN_QUEUE);
        let (ready_tx, ready_rx) = watch::channel(0);

        let actor = TunnelActor::new(local_addr, config, transport, delivery_tx, returns_tx, ready_tx);
        tokio::spawn(actor.run(cmd_rx, returns_rx));

        (Self { cmd_tx, ready_rx, local_addr }, delivery_rx)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand an inbound datagram from `from` to the core. Errors in the cell
    /// itself are handled inside the core; this only fails if it has stopped.
    pub async fn handle_cell(&self, from: SocketAddr, data: Vec<u8>) -> Result<(), TunnelError> {
        self.cmd_tx
            .send(TunnelCommand::HandleCell { from, data })
            .await
            .map_err(|_| actor_closed())
    }

    /// Report an inbound introduction from `peer`.
    pub async fn introduce(&self, peer: SocketAddr) -> Result<(), TunnelError> {
        self.cmd_tx
            .send(TunnelCommand::Introduction { peer })
            .await
            .map_err(|_| actor_closed())
    }

    pub async fn create_circuit(&self, first_hop: SocketAddr) -> Result<CircuitId, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::CreateCircuit { first_hop, reply })
            .await
            .map_err(|_| actor_closed())?;
        rx.await.map_err(|_| actor_closed())?
    }

    pub async fn extend(&self, circuit_id: CircuitId, target: SocketAddr) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::Extend { circuit_id, target, reply })
            .await
            .map_err(|_| actor_closed())?;
        rx.await.map_err(|_| actor_closed())?
    }

    /// Inject a datagram into a circuit. With no `circuit_id` the first ready
    /// circuit in creation order is used. Returns the circuit used.
    pub async fn send_data(
        &self,
        payload: Vec<u8>,
        destination: Option<Address>,
        circuit_id: Option<CircuitId>,
        origin: Option<Address>,
    ) -> Result<CircuitId, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::SendData { payload, destination, circuit_id, origin, reply })
            .await
            .map_err(|_| actor_closed())?;
        rx.await.map_err(|_| actor_closed())?
    }

    pub async fn circuit(&self, circuit_id: CircuitId) -> Option<CircuitInfo> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::Circuit { circuit_id, reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Origin circuits in creation order.
    pub async fn circuits(&self) -> Vec<CircuitInfo> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::Circuits { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn candidates(&self) -> Vec<Candidate> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::Candidates { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn random_candidate(&self, exclude: Option<SocketAddr>) -> Option<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::RandomCandidate { exclude, reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn bootstrap_peers(&self) -> Vec<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::BootstrapPeers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Run a prune pass now. Returns the peers that were dropped.
    pub async fn prune(&self) -> Vec<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::Prune { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of counters. Commands are processed in order, so the snapshot
    /// reflects every command posted before it.
    pub async fn stats(&self) -> TunnelStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(TunnelCommand::Stats { reply }).await.is_err() {
            return TunnelStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of ready origin circuits, updated as it changes.
    pub fn ready_watch(&self) -> watch::Receiver<usize> {
        self.ready_rx.clone()
    }

    pub fn ready_count(&self) -> usize {
        *self.ready_rx.borrow()
    }

    /// Wait until at least one origin circuit is ready.
    pub async fn wait_ready(&self) -> Result<(), TunnelError> {
        let mut rx = self.ready_rx.clone();
        rx.wait_for(|n| *n > 0).await.map_err(|_| actor_closed())?;
        Ok(())
    }

    /// Report that the overlay endpoint is unusable. The core stops.
    pub async fn fatal(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(TunnelCommand::Fatal { reason: reason.into() }).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(TunnelCommand::Quit).await;
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}


// ============================================================================
// TunnelActor (owns all state)
// ============================================================================

struct TunnelActor {
    local_addr: SocketAddr,
    config: TunnelConfig,
    transport: Arc<dyn CellTransport>,
    candidates: CandidatePool,
    circuits: CircuitTable,
    relays: RelayTable,
    exits: ExitEngine,
    deliveries: mpsc::Sender<Delivery>,
    ready_tx: watch::Sender<usize>,
    stats: TunnelStats,
    fatal: Option<String>,
}

impl TunnelActor {
    fn new(
        local_addr: SocketAddr,
        config: TunnelConfig,
        transport: Arc<dyn CellTransport>,
        deliveries: mpsc::Sender<Delivery>,
        returns_tx: mpsc::Sender<ExitDatagram>,
        ready_tx: watch::Sender<usize>,
    ) -> Self {
        let mut candidates = CandidatePool::new(config.candidate_freshness);
        for peer in &config.bootstrap {
            candidates.add_bootstrap(*peer);
        }
        let exits = ExitEngine::new(config.exit_bind_addr, returns_tx);
        Self {
            local_addr,
            config,
            transport,
            candidates,
            circuits: CircuitTable::new(),
            relays: RelayTable::new(),
            exits,
            deliveries,
            ready_tx,
            stats: TunnelStats::default(),
            fatal: None,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<TunnelCommand>,
        mut returns_rx: mpsc::Receiver<ExitDatagram>,
    ) {
        let mut prune_interval =
            tokio::time::interval(self.config.prune_interval.max(Duration::from_millis(1)));
        prune_interval.tick().await; // Skip initial tick

        info!(
            addr = %self.local_addr,
            exit = self.config.exit_enabled,
            bootstrap = self.config.bootstrap.len(),
            "TunnelCore actor started"
        );

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TunnelCommand::Quit) | None => {
                            debug!("tunnel actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(datagram) = returns_rx.recv() => {
                    self.on_exit_datagram(datagram).await;
                }
                _ = prune_interval.tick() => {
                    self.prune();
                }
            }

            if let Some(reason) = &self.fatal {
                warn!(reason = %reason, "tunnel core stopping on fatal error");
                break;
            }
        }

        let circuits = self.circuits.clear();
        let exits = self.exits.len();
        self.exits.clear();
        self.publish_ready();
        info!(circuits, exit_sockets = exits, "TunnelCore actor stopped");
    }

    async fn handle_command(&mut self, cmd: TunnelCommand) {
        match cmd {
            TunnelCommand::HandleCell { from, data } => {
                self.on_datagram(from, data).await;
            }
            TunnelCommand::Introduction { peer } => {
                self.on_introduction(peer).await;
            }
            TunnelCommand::CreateCircuit { first_hop, reply } => {
                let result = self.create_circuit(first_hop).await;
                let _ = reply.send(result);
            }
            TunnelCommand::Extend { circuit_id, target, reply } => {
                let result = self.extend(circuit_id, target).await;
                let _ = reply.send(result);
            }
            TunnelCommand::SendData { payload, destination, circuit_id, origin, reply } => {
                let result = self.send_data(payload, destination, circuit_id, origin).await;
                let _ = reply.send(result);
            }
            TunnelCommand::Circuit { circuit_id, reply } => {
                let _ = reply.send(self.circuits.get(circuit_id).map(CircuitInfo::from));
            }
            TunnelCommand::Circuits { reply } => {
                let _ = reply.send(self.circuits.iter().map(CircuitInfo::from).collect());
            }
            TunnelCommand::Candidates { reply } => {
                let _ = reply.send(self.candidates.snapshot());
            }
            TunnelCommand::RandomCandidate { exclude, reply } => {
                let _ = reply.send(self.candidates.random_live(exclude));
            }
            TunnelCommand::BootstrapPeers { reply } => {
                let _ = reply.send(self.candidates.bootstrap_peers());
            }
            TunnelCommand::Prune { reply } => {
                let _ = reply.send(self.prune());
            }
            TunnelCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            TunnelCommand::Fatal { reason } => {
                self.fatal = Some(reason);
            }
            TunnelCommand::Quit => {}
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    async fn send(&mut self, out: Outbound) -> Result<(), TunnelError> {
        let frame = out.cell.encode();
        trace!(to = %out.to, kind = %out.cell.kind(), circuit = out.cell.circuit_id(), "sending cell");
        self.transport.send_cell(out.to, &frame).await?;
        self.stats.cells_sent += 1;
        Ok(())
    }

    /// Send each cell; a failure is recorded and does not stop the rest.
    async fn send_all(&mut self, outs: Vec<Outbound>) {
        for out in outs {
            if let Err(e) = self.send(out).await {
                self.record_error(None, e);
            }
        }
    }

    fn record_error(&mut self, from: Option<SocketAddr>, err: TunnelError) {
        match &err {
            TunnelError::BadFrame(_) => self.stats.bad_frame += 1,
            TunnelError::UnknownCircuit(_) => self.stats.unknown_circuit += 1,
            TunnelError::ProtocolViolation(_) => self.stats.protocol_violation += 1,
            TunnelError::NoRoute(_) => self.stats.no_route += 1,
            TunnelError::Transient(_) => self.stats.transient_io += 1,
            TunnelError::NoReadyCircuit | TunnelError::Fatal(_) => {}
        }
        match err {
            TunnelError::Fatal(reason) => {
                self.fatal = Some(reason);
            }
            TunnelError::Transient(e) => {
                debug!(from = ?from, error = %e, "transient failure, cell dropped");
            }
            other => {
                debug!(from = ?from, reason = other.kind(), error = %other, "cell dropped");
            }
        }
    }

    fn publish_ready(&self) {
        let ready = self.circuits.ready_count();
        self.ready_tx.send_if_modified(|current| {
            if *current != ready {
                *current = ready;
                true
            } else {
                false
            }
        });
    }

    fn snapshot_stats(&self) -> TunnelStats {
        TunnelStats {
            circuits: self.circuits.len(),
            ready_circuits: self.circuits.ready_count(),
            relay_bindings: self.relays.binding_count(),
            tail_circuits: self.relays.tail_count(),
            exit_sockets: self.exits.len(),
            exit_sockets_opened: self.exits.opened_total(),
            candidates: self.candidates.snapshot().len(),
            ..self.stats.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    async fn on_introduction(&mut self, peer: SocketAddr) {
        if peer == self.local_addr {
            return;
        }
        let heartbeat = self.candidates.on_inbound_introduction(peer);
        if !heartbeat || !self.config.auto_circuits {
            return;
        }
        match self.circuits.on_heartbeat(peer, self.config.max_circuits) {
            Ok(outs) => {
                if !outs.is_empty() {
                    trace!(peer = %peer, cells = outs.len(), "heartbeat grew circuits");
                }
                self.send_all(outs).await;
            }
            Err(e) => self.record_error(Some(peer), e.into()),
        }
    }

    async fn create_circuit(&mut self, first_hop: SocketAddr) -> Result<CircuitId, TunnelError> {
        if first_hop == self.local_addr {
            return Err(TunnelError::ProtocolViolation("circuit to self"));
        }
        let (id, create) = self.circuits.create(first_hop)?;
        self.send(create).await?;
        Ok(id)
    }

    async fn extend(&mut self, circuit_id: CircuitId, target: SocketAddr) -> Result<(), TunnelError> {
        if target == self.local_addr {
            return Err(TunnelError::ProtocolViolation("cannot extend a circuit to its origin"));
        }
        if let Some(out) = self.circuits.extend(circuit_id, target)? {
            self.send(out).await?;
        }
        Ok(())
    }

    async fn send_data(
        &mut self,
        payload: Vec<u8>,
        destination: Option<Address>,
        circuit_id: Option<CircuitId>,
        origin: Option<Address>,
    ) -> Result<CircuitId, TunnelError> {
        let id = match circuit_id {
            Some(id) => id,
            None => self.circuits.select_ready().ok_or(TunnelError::NoReadyCircuit)?,
        };
        let circuit = self.circuits.get(id).ok_or(TunnelError::UnknownCircuit(id))?;
        if !circuit.is_ready() {
            return Err(TunnelError::NoRoute(id));
        }
        let first_hop = circuit.first_hop;
        trace!(circuit = id, len = payload.len(), "sending local data");
        self.send(Outbound::new(
            first_hop,
            Cell::Data { circuit_id: id, destination, origin, payload },
        ))
        .await?;
        Ok(id)
    }

    /// Drop stale candidates and everything that routes through them, then
    /// expire unanswered CREATEs and idle relay state.
    fn prune(&mut self) -> Vec<SocketAddr> {
        let lost = self.candidates.prune();
        for peer in &lost {
            for circuit in self.circuits.close_first_hop(*peer) {
                info!(circuit = circuit.id, first_hop = %peer, "circuit abandoned, first hop lost");
            }
            self.circuits.forget_peer(peer);
            let loss = self.relays.remove_neighbor(*peer);
            for key in &loss.accepted {
                self.exits.teardown(key);
            }
            self.exits.teardown_neighbor(*peer);
        }

        for circuit in self.circuits.expire_waiting(self.config.create_timeout) {
            info!(circuit = circuit.id, first_hop = %circuit.first_hop, "circuit abandoned, no CREATED");
        }
        let idle = self.relays.expire_idle(self.config.relay_idle_timeout);
        for key in &idle.accepted {
            self.exits.teardown(key);
        }

        if !lost.is_empty() {
            self.publish_ready();
        }
        lost
    }

    // ------------------------------------------------------------------------
    // Cell dispatch
    // ------------------------------------------------------------------------

    async fn on_datagram(&mut self, from: SocketAddr, data: Vec<u8>) {
        self.stats.cells_received += 1;
        let result = match Cell::decode(&data) {
            Ok(cell) => {
                trace!(from = %from, kind = %cell.kind(), circuit = cell.circuit_id(), "cell received");
                self.dispatch(from, cell).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.record_error(Some(from), e);
        }
    }

    async fn dispatch(&mut self, from: SocketAddr, cell: Cell) -> Result<(), TunnelError> {
        match cell {
            Cell::Create { circuit_id } => self.on_create(from, circuit_id).await,
            Cell::Created { circuit_id } => self.on_created(from, circuit_id).await,
            Cell::Extend { circuit_id, target } => self.on_extend(from, circuit_id, target).await,
            Cell::Extended { circuit_id, joined } => self.on_extended(from, circuit_id, joined).await,
            Cell::Data { circuit_id, destination, origin, payload } => {
                self.on_data(from, circuit_id, destination, origin, payload).await
            }
        }
    }

    fn is_origin_of(&self, from: SocketAddr, id: CircuitId) -> bool {
        self.circuits.get(id).is_some_and(|c| c.first_hop == from)
    }

    fn is_local_address(&self, addr: &Address) -> bool {
        addr.to_socket_addr() == Some(self.local_addr)
    }

    async fn on_create(&mut self, from: SocketAddr, id: CircuitId) -> Result<(), TunnelError> {
        if self.is_origin_of(from, id) {
            return Err(TunnelError::ProtocolViolation("CREATE for a circuit this peer originates"));
        }
        if self.relays.route(from, id).is_some() {
            return Err(TunnelError::ProtocolViolation("CREATE on a relayed circuit"));
        }
        self.relays.accept(from, id)?;
        debug!(circuit = id, from = %from, "accepted CREATE");
        self.send(Outbound::new(from, Cell::Created { circuit_id: id })).await
    }

    async fn on_created(&mut self, from: SocketAddr, id: CircuitId) -> Result<(), TunnelError> {
        if self.is_origin_of(from, id) {
            let next = self.circuits.on_created(from, id)?;
            info!(circuit = id, first_hop = %from, "circuit ready");
            self.publish_ready();
            if let Some(out) = next {
                self.send(out).await?;
            }
            return Ok(());
        }
        if let Some((prev, _)) = self.relays.lookup_backward(from, id) {
            // We extended this circuit to `from`; report the new hop upstream.
            debug!(circuit = id, joined = %from, to = %prev, "splicing CREATED into EXTENDED");
            return self
                .send(Outbound::new(
                    prev,
                    Cell::Extended { circuit_id: id, joined: Address::from(from) },
                ))
                .await;
        }
        if self.circuits.contains_id(id) {
            return Err(TunnelError::ProtocolViolation("CREATED from a peer other than the first hop"));
        }
        Err(TunnelError::UnknownCircuit(id))
    }

    async fn on_extend(&mut self, from: SocketAddr, id: CircuitId, target: Address) -> Result<(), TunnelError> {
        if self.is_origin_of(from, id) {
            return Err(TunnelError::ProtocolViolation("EXTEND travelling towards the origin"));
        }
        if let Some((next, _)) = self.relays.lookup_forward(from, id) {
            self.relays.record_activity(from, id, 0);
            trace!(circuit = id, to = %next, "forwarding EXTEND");
            return self
                .send(Outbound::new(next, Cell::Extend { circuit_id: id, target }))
                .await;
        }
        if self.relays.lookup_backward(from, id).is_some() {
            return Err(TunnelError::ProtocolViolation("EXTEND from the exit side"));
        }
        if !self.relays.is_accepted(from, id) {
            return Err(TunnelError::UnknownCircuit(id));
        }

        // Tail: only peers we know to be live are reachable hops.
        let usable = target
            .to_socket_addr()
            .filter(|t| *t != from && *t != self.local_addr && self.candidates.is_live(t));
        let Some(target_addr) = usable else {
            self.stats.extend_target_dropped += 1;
            debug!(circuit = id, target = %target, "EXTEND target is not a live candidate, dropped");
            return Ok(());
        };

        self.relays.install(from, target_addr, id)?;
        if self.exits.teardown(&(from, id)) {
            debug!(circuit = id, "exit socket closed, circuit extended past this peer");
        }
        self.send(Outbound::new(target_addr, Cell::Create { circuit_id: id })).await
    }

    async fn on_extended(&mut self, from: SocketAddr, id: CircuitId, joined: Address) -> Result<(), TunnelError> {
        if self.is_origin_of(from, id) {
            let joined_addr = joined
                .to_socket_addr()
                .ok_or(TunnelError::ProtocolViolation("EXTENDED names an unusable address"))?;
            if let Some(out) = self.circuits.on_extended(from, id, joined_addr)? {
                self.send(out).await?;
            }
            return Ok(());
        }
        if let Some((prev, _)) = self.relays.lookup_backward(from, id) {
            self.relays.record_activity(from, id, 0);
            trace!(circuit = id, to = %prev, "forwarding EXTENDED");
            return self
                .send(Outbound::new(prev, Cell::Extended { circuit_id: id, joined }))
                .await;
        }
        if self.circuits.contains_id(id) {
            return Err(TunnelError::ProtocolViolation("EXTENDED from a peer other than the first hop"));
        }
        Err(TunnelError::UnknownCircuit(id))
    }

    async fn on_data(
        &mut self,
        from: SocketAddr,
        id: CircuitId,
        destination: Option<Address>,
        origin: Option<Address>,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        if self.is_origin_of(from, id) {
            return self.deliver(from, id, destination, origin, payload);
        }
        if let Some(((next, _), direction)) = self.relays.route(from, id) {
            self.relays.record_activity(from, id, payload.len());
            self.stats.data_relayed += 1;
            trace!(circuit = id, to = %next, ?direction, len = payload.len(), "relaying DATA");
            return self
                .send(Outbound::new(next, Cell::Data { circuit_id: id, destination, origin, payload }))
                .await;
        }
        if !self.relays.is_accepted(from, id) {
            return Err(TunnelError::UnknownCircuit(id));
        }

        // Tail.
        self.relays.touch_accepted(from, id);
        let external = match destination {
            Some(dst) if !self.is_local_address(&dst) => dst,
            other => return self.deliver(from, id, other, origin, payload),
        };
        if !self.config.exit_enabled {
            return Err(TunnelError::NoRoute(id));
        }
        trace!(circuit = id, destination = %external, len = payload.len(), "exiting DATA");
        self.exits.send((from, id), payload, external).await?;
        self.stats.data_exited += 1;
        Ok(())
    }

    fn deliver(
        &mut self,
        from: SocketAddr,
        id: CircuitId,
        destination: Option<Address>,
        origin: Option<Address>,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        let delivery = Delivery { circuit_id: id, from, destination, origin, payload };
        self.deliveries
            .try_send(delivery)
            .map_err(|_| TunnelError::queue_full("delivery"))?;
        self.stats.data_delivered += 1;
        Ok(())
    }

    async fn on_exit_datagram(&mut self, datagram: ExitDatagram) {
        let ExitDatagram { key: (prev, id), from, payload } = datagram;
        if !self.relays.is_tail(prev, id) {
            trace!(circuit = id, "exit reply for a torn-down circuit, dropped");
            return;
        }
        self.stats.exit_replies += 1;
        self.relays.touch_accepted(prev, id);
        let reply = Cell::Data {
            circuit_id: id,
            destination: None,
            origin: Some(Address::from(from)),
            payload,
        };
        if let Err(e) = self.send(Outbound::new(prev, reply)).await {
            self.record_error(Some(prev), e);
        }
    }
}
