//! Transport seam between the tunnel core and the overlay.
//!
//! The core never touches a socket for cell traffic. It hands encoded cells
//! to a [`CellTransport`], which the UDP overlay implements for real nodes and
//! tests replace with an in-memory network.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`CellTransport`] | `overlay::UdpOverlay` | Deliver one cell datagram to a neighbor |
//!
//! Inbound cells flow the other way through `TunnelCore::handle_cell`, with
//! the sender's transport address attached by the overlay.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TunnelError;

#[derive(Debug)]
pub enum TransportError {
    /// The send failed; later sends may succeed.
    Io(io::Error),
    /// The endpoint is gone for good.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "overlay send failed: {}", e),
            TransportError::Closed => write!(f, "overlay endpoint closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Closed => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => TunnelError::Transient(e),
            TransportError::Closed => TunnelError::Fatal("overlay endpoint closed".to_string()),
        }
    }
}

/// Cell delivery over the overlay.
#[async_trait]
pub trait CellTransport: Send + Sync + 'static {
    /// Send one encoded cell to `to` as a single datagram.
    async fn send_cell(&self, to: SocketAddr, frame: &[u8]) -> Result<(), TransportError>;
}
