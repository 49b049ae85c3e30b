//! UDP overlay endpoint.
//!
//! One UDP socket carries both tunnel cells and introduction frames. The
//! receive loop demultiplexes on magic bytes: introductions feed the
//! candidate pool, everything else goes to the tunnel core as a cell (which
//! decodes and counts bad frames itself).
//!
//! A walker task periodically sends an introduction request to the next peer
//! to visit: a peer named in a recent response, else a random live
//! candidate, else the bootstrap peers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cell::MAX_CELL_SIZE;
use crate::error::TunnelError;
use crate::messages::IntroMessage;
use crate::protocols::{CellTransport, TransportError};
use crate::tunnel::TunnelCore;

/// Default interval between introduction requests.
pub const DEFAULT_WALK_INTERVAL: Duration = Duration::from_secs(5);

/// Peers learned from responses, waiting to be walked.
/// SECURITY: Bounded; excess introductions are dropped.
const MAX_WALK_QUEUE: usize = 64;

/// Consecutive receive errors after which the endpoint is declared unusable.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 32;

pub struct UdpOverlay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

/// Background tasks of a running overlay. Aborted on drop.
pub struct OverlayTasks {
    receive: JoinHandle<()>,
    walker: JoinHandle<()>,
}

impl OverlayTasks {
    pub fn abort(&self) {
        self.receive.abort();
        self.walker.abort();
    }
}

impl Drop for OverlayTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

impl UdpOverlay {
    pub async fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "overlay endpoint bound");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the receive loop and the walker, feeding `core`.
    pub fn start(&self, core: TunnelCore, walk_interval: Duration) -> OverlayTasks {
        let (walk_tx, walk_rx) = mpsc::channel(MAX_WALK_QUEUE);
        let receive = tokio::spawn(run_receive_loop(
            self.socket.clone(),
            self.local_addr,
            core.clone(),
            walk_tx,
        ));
        let walker = tokio::spawn(run_walker(self.socket.clone(), core, walk_rx, walk_interval));
        OverlayTasks { receive, walker }
    }

    /// Send an introduction request to `peer` right away.
    pub async fn introduce_to(&self, peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(&IntroMessage::Request.to_bytes(), peer).await?;
        Ok(())
    }
}

#[async_trait]
impl CellTransport for UdpOverlay {
    async fn send_cell(&self, to: SocketAddr, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_CELL_SIZE {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cell of {} bytes exceeds datagram limit", frame.len()),
            )));
        }
        self.socket.send_to(frame, to).await?;
        Ok(())
    }
}

async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    core: TunnelCore,
    walk_tx: mpsc::Sender<SocketAddr>,
) {
    let mut buf = vec![0u8; MAX_CELL_SIZE];
    let mut consecutive_errors = 0u32;

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                consecutive_errors = 0;
                received
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                trace!(error = %e, "ignoring ICMP-induced receive error");
                continue;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "overlay receive failed");
                if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                    core.fatal(format!("overlay socket unusable: {}", e)).await;
                    break;
                }
                continue;
            }
        };

        let data = &buf[..len];
        let result = if IntroMessage::is_intro(data) {
            on_intro(&socket, local_addr, &core, &walk_tx, from, data).await
        } else {
            core.handle_cell(from, data.to_vec()).await
        };
        if result.is_err() {
            debug!("tunnel core closed, overlay receive loop exiting");
            break;
        }
    }
}

async fn on_intro(
    socket: &UdpSocket,
    local_addr: SocketAddr,
    core: &TunnelCore,
    walk_tx: &mpsc::Sender<SocketAddr>,
    from: SocketAddr,
    data: &[u8],
) -> Result<(), TunnelError> {
    match IntroMessage::from_bytes(data) {
        Some(IntroMessage::Request) => {
            core.introduce(from).await?;
            let introduced = core.random_candidate(Some(from)).await;
            let response = IntroMessage::Response { introduced }.to_bytes();
            if let Err(e) = socket.send_to(&response, from).await {
                debug!(to = %from, error = %e, "introduction response failed");
            }
            trace!(from = %from, introduced = ?introduced, "answered introduction request");
        }
        Some(IntroMessage::Response { introduced }) => {
            core.introduce(from).await?;
            if let Some(peer) = introduced
                && peer != local_addr
                && peer != from
                && walk_tx.try_send(peer).is_err()
            {
                trace!(peer = %peer, "walk queue full, introduction dropped");
            }
        }
        None => {
            trace!(from = %from, len = data.len(), "malformed introduction frame");
        }
    }
    Ok(())
}

async fn run_walker(
    socket: Arc<UdpSocket>,
    core: TunnelCore,
    mut walk_rx: mpsc::Receiver<SocketAddr>,
    walk_interval: Duration,
) {
    let mut interval = tokio::time::interval(walk_interval.max(Duration::from_millis(10)));
    let request = IntroMessage::Request.to_bytes();

    loop {
        interval.tick().await;
        if core.is_closed() {
            break;
        }

        let targets = match walk_rx.try_recv() {
            Ok(peer) => vec![peer],
            Err(_) => match core.random_candidate(None).await {
                Some(peer) => vec![peer],
                None => core.bootstrap_peers().await,
            },
        };

        for target in targets {
            match socket.send_to(&request, target).await {
                Ok(_) => trace!(to = %target, "introduction request sent"),
                Err(e) => debug!(to = %target, error = %e, "introduction request failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::tunnel::TunnelConfig;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_send_cell_reaches_peer() {
        let overlay = UdpOverlay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = Cell::Create { circuit_id: 11 }.encode();

        overlay.send_cell(peer.local_addr().unwrap(), &frame).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(TEST_TIMEOUT, peer.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(&buf[..n], &frame[..]);
        assert_eq!(from, overlay.local_addr());
    }

    #[tokio::test]
    async fn test_oversized_cell_rejected() {
        let overlay = UdpOverlay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let frame = vec![0u8; MAX_CELL_SIZE + 1];
        let result = overlay.send_cell("127.0.0.1:9".parse().unwrap(), &frame).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_request_is_answered_and_introduces_sender() {
        let overlay = UdpOverlay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let config = TunnelConfig { auto_circuits: false, ..Default::default() };
        let (core, _deliveries) = TunnelCore::spawn(overlay.local_addr(), config, overlay.clone());
        let _tasks = overlay.start(core.clone(), Duration::from_secs(3600));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        peer.send_to(&IntroMessage::Request.to_bytes(), overlay.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(TEST_TIMEOUT, peer.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        // The only candidate is the requester itself, which is excluded.
        assert_eq!(
            IntroMessage::from_bytes(&buf[..n]),
            Some(IntroMessage::Response { introduced: None })
        );

        let candidates = core.candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr, peer_addr);
        core.quit().await;
    }
}
