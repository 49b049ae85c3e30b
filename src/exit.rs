//! Exit engine: native UDP egress for circuits that end at this peer.
//!
//! Each tail circuit `(previous_hop, id)` that carries traffic to an external
//! destination gets its own UDP socket, bound lazily on first use to an
//! ephemeral port. The socket is owned by a dedicated task:
//!
//! - outbound payloads arrive on a bounded queue and are sent best-effort;
//! - every datagram received is posted back to the tunnel core as an
//!   [`ExitDatagram`], which turns it into a reply DATA cell.
//!
//! [`ExitSocket`] aborts its task on drop, which closes the socket and
//! releases the port. Removing an entry from the engine is teardown.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cell::Address;
use crate::error::TunnelError;
use crate::relay::HopKey;

/// Maximum concurrent exit sockets.
/// SECURITY: Each socket holds a port and a task; bounds resource use from
/// circuits that exit through this peer.
pub const MAX_EXIT_SOCKETS: usize = 1_024;

/// Depth of each exit socket's outbound queue. A full queue drops payloads.
pub const EXIT_QUEUE_DEPTH: usize = 64;

/// Receive buffer for exit sockets (largest UDP payload).
const MAX_DATAGRAM: usize = 65_535;

/// A datagram received on an exit socket, to be returned along the circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDatagram {
    pub key: HopKey,
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct ExitSocket {
    tx: mpsc::Sender<(Vec<u8>, Address)>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    created_at: Instant,
    sent: u64,
}

impl ExitSocket {
    async fn open(
        bind_addr: SocketAddr,
        key: HopKey,
        returns: mpsc::Sender<ExitDatagram>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(EXIT_QUEUE_DEPTH);
        let task = tokio::spawn(run_exit_socket(socket, key, rx, returns));
        Ok(Self {
            tx,
            task,
            local_addr,
            created_at: Instant::now(),
            sent: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn enqueue(&mut self, payload: Vec<u8>, dst: Address) -> Result<(), TunnelError> {
        self.tx
            .try_send((payload, dst))
            .map_err(|_| TunnelError::queue_full("exit socket"))?;
        self.sent += 1;
        Ok(())
    }
}

impl Drop for ExitSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_exit_socket(
    socket: UdpSocket,
    key: HopKey,
    mut rx: mpsc::Receiver<(Vec<u8>, Address)>,
    returns: mpsc::Sender<ExitDatagram>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((payload, dst)) = msg else {
                    break;
                };
                if let Err(e) = send_to_destination(&socket, &payload, &dst).await {
                    debug!(circuit = key.1, destination = %dst, error = %e, "exit send failed");
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        trace!(circuit = key.1, from = %from, len, "exit reply received");
                        let datagram = ExitDatagram { key, from, payload: buf[..len].to_vec() };
                        if returns.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(circuit = key.1, error = %e, "exit recv failed");
                    }
                }
            }
        }
    }
}

async fn send_to_destination(socket: &UdpSocket, payload: &[u8], dst: &Address) -> io::Result<()> {
    let target = resolve(socket, dst).await?;
    socket.send_to(payload, target).await?;
    trace!(destination = %target, len = payload.len(), "exit datagram sent");
    Ok(())
}

/// Turn a cell address into a socket address of the socket's family.
async fn resolve(socket: &UdpSocket, dst: &Address) -> io::Result<SocketAddr> {
    if let Some(addr) = dst.to_socket_addr() {
        return Ok(addr);
    }
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("unusable destination {}", dst));
    let port = u16::try_from(dst.port).map_err(|_| invalid())?;
    let host = dst.host_str().ok_or_else(invalid)?;
    let want_v4 = socket.local_addr()?.is_ipv4();
    tokio::net::lookup_host((host, port))
        .await?
        .find(|addr| addr.is_ipv4() == want_v4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", dst)))
}

pub struct ExitEngine {
    sockets: HashMap<HopKey, ExitSocket>,
    bind_addr: SocketAddr,
    returns: mpsc::Sender<ExitDatagram>,
    opened_total: u64,
}

impl ExitEngine {
    pub fn new(bind_addr: SocketAddr, returns: mpsc::Sender<ExitDatagram>) -> Self {
        Self {
            sockets: HashMap::new(),
            bind_addr,
            returns,
            opened_total: 0,
        }
    }

    /// Send `payload` to `dst` from the exit socket of `key`, opening it on
    /// first use. Returns `true` when a new socket was opened.
    pub async fn send(&mut self, key: HopKey, payload: Vec<u8>, dst: Address) -> Result<bool, TunnelError> {
        let mut opened = false;
        if !self.sockets.contains_key(&key) {
            if self.sockets.len() >= MAX_EXIT_SOCKETS {
                warn!(circuit = key.1, "exit socket limit reached");
                return Err(TunnelError::Transient(io::Error::other("exit socket limit reached")));
            }
            let socket = ExitSocket::open(self.bind_addr, key, self.returns.clone()).await?;
            debug!(
                circuit = key.1,
                previous_hop = %key.0,
                local = %socket.local_addr(),
                "exit socket opened"
            );
            self.sockets.insert(key, socket);
            self.opened_total += 1;
            opened = true;
        }
        if let Some(socket) = self.sockets.get_mut(&key) {
            socket.enqueue(payload, dst)?;
        }
        Ok(opened)
    }

    pub fn teardown(&mut self, key: &HopKey) -> bool {
        match self.sockets.remove(key) {
            Some(socket) => {
                debug!(
                    circuit = key.1,
                    sent = socket.sent,
                    age_ms = socket.created_at.elapsed().as_millis() as u64,
                    "exit socket closed"
                );
                true
            }
            None => false,
        }
    }

    /// Close every socket whose previous hop is `peer`.
    pub fn teardown_neighbor(&mut self, peer: SocketAddr) -> usize {
        let keys: Vec<HopKey> = self.sockets.keys().filter(|k| k.0 == peer).copied().collect();
        keys.iter().filter(|k| self.teardown(k)).count()
    }

    pub fn contains(&self, key: &HopKey) -> bool {
        self.sockets.contains_key(key)
    }

    pub fn local_addr(&self, key: &HopKey) -> Option<SocketAddr> {
        self.sockets.get(key).map(|s| s.local_addr())
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total
    }

    pub fn clear(&mut self) {
        self.sockets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn hop(port: u16) -> HopKey {
        (SocketAddr::from(([10, 0, 0, 2], port)), 77)
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 1500];
        let (n, from) = tokio::time::timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out")
            .expect("recv failed");
        (buf[..n].to_vec(), from)
    }

    #[tokio::test]
    async fn test_socket_opened_once_and_reused() {
        let target = UdpSocket::bind(loopback()).await.unwrap();
        let dst = Address::from(target.local_addr().unwrap());
        let (returns_tx, _returns_rx) = mpsc::channel(16);
        let mut engine = ExitEngine::new(loopback(), returns_tx);

        assert!(engine.send(hop(1), b"hi".to_vec(), dst.clone()).await.unwrap());
        assert!(!engine.send(hop(1), b"again".to_vec(), dst).await.unwrap());
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.opened_total(), 1);

        let (first, from_a) = recv(&target).await;
        let (second, from_b) = recv(&target).await;
        assert_eq!(first, b"hi");
        assert_eq!(second, b"again");
        assert_eq!(from_a, from_b);
        assert_eq!(Some(from_a), engine.local_addr(&hop(1)));
    }

    #[tokio::test]
    async fn test_replies_are_posted_back() {
        let target = UdpSocket::bind(loopback()).await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let (returns_tx, mut returns_rx) = mpsc::channel(16);
        let mut engine = ExitEngine::new(loopback(), returns_tx);

        engine.send(hop(1), b"ping".to_vec(), Address::from(target_addr)).await.unwrap();
        let (_, exit_addr) = recv(&target).await;
        target.send_to(b"pong", exit_addr).await.unwrap();

        let datagram = tokio::time::timeout(TEST_TIMEOUT, returns_rx.recv())
            .await
            .expect("timed out")
            .expect("engine dropped");
        assert_eq!(datagram, ExitDatagram { key: hop(1), from: target_addr, payload: b"pong".to_vec() });
    }

    #[tokio::test]
    async fn test_distinct_circuits_get_distinct_sockets() {
        let (returns_tx, _returns_rx) = mpsc::channel(16);
        let mut engine = ExitEngine::new(loopback(), returns_tx);
        let dst = Address::new("127.0.0.1", 9);

        engine.send(hop(1), vec![1], dst.clone()).await.unwrap();
        engine.send(hop(2), vec![2], dst).await.unwrap();
        assert_eq!(engine.len(), 2);
        assert_ne!(engine.local_addr(&hop(1)), engine.local_addr(&hop(2)));

        assert_eq!(engine.teardown_neighbor(hop(1).0), 1);
        assert!(!engine.contains(&hop(1)));
        assert!(engine.contains(&hop(2)));
    }

    #[tokio::test]
    async fn test_teardown_stops_return_path() {
        let target = UdpSocket::bind(loopback()).await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let (returns_tx, mut returns_rx) = mpsc::channel(16);
        let mut engine = ExitEngine::new(loopback(), returns_tx);

        engine.send(hop(1), b"ping".to_vec(), Address::from(target_addr)).await.unwrap();
        let (_, exit_addr) = recv(&target).await;

        assert!(engine.teardown(&hop(1)));
        assert!(!engine.teardown(&hop(1)));
        tokio::task::yield_now().await;
        let _ = target.send_to(b"late", exit_addr).await;

        let late = tokio::time::timeout(Duration::from_millis(200), returns_rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_domain_destination_is_resolved() {
        let target = UdpSocket::bind(loopback()).await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (returns_tx, _returns_rx) = mpsc::channel(16);
        let mut engine = ExitEngine::new(loopback(), returns_tx);

        engine.send(hop(1), b"named".to_vec(), Address::new("localhost", u32::from(port))).await.unwrap();
        let (payload, _) = recv(&target).await;
        assert_eq!(payload, b"named");
    }
}
