//! In-memory overlay for driving several tunnel cores in one process.
//!
//! Every peer gets a `SimTransport` that records each cell it sends on a
//! shared wire log and hands the frame to the destination peer's core via a
//! per-peer pump task.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use veilnet::{Cell, CellKind, CellTransport, CircuitId, Delivery, TransportError, TunnelConfig, TunnelCore};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCell {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub cell: Cell,
}

#[derive(Default)]
struct Shared {
    wire: Mutex<Vec<WireCell>>,
    inboxes: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>>,
}

#[derive(Clone, Default)]
pub struct SimNet {
    shared: Arc<Shared>,
}

pub struct SimTransport {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

#[async_trait]
impl CellTransport for SimTransport {
    async fn send_cell(&self, to: SocketAddr, frame: &[u8]) -> Result<(), TransportError> {
        if let Ok(cell) = Cell::decode(frame) {
            self.shared
                .wire
                .lock()
                .unwrap()
                .push(WireCell { from: self.addr, to, cell });
        }
        // Frames to peers that are not attached are lost, like UDP.
        if let Some(inbox) = self.shared.inboxes.lock().unwrap().get(&to) {
            let _ = inbox.send((self.addr, frame.to_vec()));
        }
        Ok(())
    }
}

/// A core attached to the simulated network.
pub struct SimPeer {
    pub addr: SocketAddr,
    pub core: TunnelCore,
    pub deliveries: mpsc::Receiver<Delivery>,
    pub pump: PumpGuard,
}

/// Aborts the peer's inbound pump on drop.
pub struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SimNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_peer(&self, addr: SocketAddr, config: TunnelConfig) -> SimPeer {
        let transport = Arc::new(SimTransport { addr, shared: self.shared.clone() });
        let (core, deliveries) = TunnelCore::spawn(addr, config, transport);

        let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();
        self.shared.inboxes.lock().unwrap().insert(addr, tx);
        let pump_core = core.clone();
        let pump = tokio::spawn(async move {
            while let Some((from, frame)) = rx.recv().await {
                if pump_core.handle_cell(from, frame).await.is_err() {
                    break;
                }
            }
        });

        SimPeer { addr, core, deliveries, pump: PumpGuard(pump) }
    }

    /// Hand `cell` to `peer` as if `from` had sent it, without logging
    /// it on the wire.
    pub async fn inject(&self, peer: &SimPeer, from: SocketAddr, cell: &Cell) {
        peer.core.handle_cell(from, cell.encode()).await.unwrap();
        // `handle_cell` only queues the cell; a round-trip through the same
        // command channel waits until the actor has processed it.
        let _ = peer.core.stats().await;
    }

    pub fn wire(&self) -> Vec<WireCell> {
        self.shared.wire.lock().unwrap().clone()
    }

    pub fn wire_len(&self) -> usize {
        self.shared.wire.lock().unwrap().len()
    }

    pub fn wire_since(&self, mark: usize) -> Vec<WireCell> {
        self.shared.wire.lock().unwrap()[mark..].to_vec()
    }

    /// `(from, to, kind)` triples, for asserting cell sequences.
    pub fn wire_kinds(&self) -> Vec<(SocketAddr, SocketAddr, CellKind)> {
        self.wire().iter().map(|w| (w.from, w.to, w.cell.kind())).collect()
    }
}

/// Tunnel configuration for scenario tests: circuits are only built
/// explicitly and exit sockets stay on loopback.
pub fn manual_config() -> TunnelConfig {
    TunnelConfig {
        auto_circuits: false,
        exit_bind_addr: "127.0.0.1:0".parse().unwrap(),
        prune_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Origin A, middle B, tail C.
pub struct Trio {
    pub net: SimNet,
    pub a: SimPeer,
    pub b: SimPeer,
    pub c: SimPeer,
}

pub fn trio() -> Trio {
    init_tracing();
    let net = SimNet::new();
    let a = net.spawn_peer(addr("10.0.0.1:7000"), manual_config());
    let b = net.spawn_peer(addr("10.0.0.2:7000"), manual_config());
    let c = net.spawn_peer(addr("10.0.0.3:7000"), manual_config());
    Trio { net, a, b, c }
}

/// Build A -> B -> C and return the circuit id.
pub async fn build_circuit(t: &Trio) -> CircuitId {
    // B only extends towards peers it knows to be live.
    t.b.core.introduce(t.c.addr).await.unwrap();

    let id = t.a.core.create_circuit(t.b.addr).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, t.a.core.wait_ready())
        .await
        .expect("circuit never ready")
        .unwrap();

    t.a.core.extend(id, t.c.addr).await.unwrap();
    let core = t.a.core.clone();
    eventually("EXTENDED at origin", || {
        let core = core.clone();
        async move { core.circuit(id).await.is_some_and(|c| c.hops.len() == 1) }
    })
    .await;
    id
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Poll `check` until it returns true or the test timeout elapses.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
