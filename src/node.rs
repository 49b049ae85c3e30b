//! # High-Level Node API
//!
//! A [`Node`] wires the tunnel subsystem into a runnable peer: the UDP
//! overlay endpoint, the tunnel core actor, and (optionally) the SOCKS5
//! ingress.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = NodeConfig {
//!     overlay_addr: "0.0.0.0:7000".parse()?,
//!     socks_addr: Some("127.0.0.1:1080".parse()?),
//!     bootstrap: vec!["198.51.100.1:7000".parse()?],
//!     ..Default::default()
//! };
//! let node = Node::bind(config).await?;
//!
//! // Point a SOCKS5 client at node.socks_addr() and send UDP.
//! node.tunnel().wait_ready().await?;
//! ```
//!
//! ## Component Integration
//!
//! - **UdpOverlay**: cells and introduction walk on one UDP socket
//! - **TunnelCore**: circuits, relay bindings, exit sockets
//! - **Socks5Server**: UDP ASSOCIATE front-end for local applications
//!
//! With SOCKS5 disabled, local deliveries are available once through
//! [`Node::deliveries`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::overlay::{DEFAULT_WALK_INTERVAL, OverlayTasks, UdpOverlay};
use crate::socks5::Socks5Server;
use crate::tunnel::{Delivery, TunnelConfig, TunnelCore, TunnelStats};

/// Default SOCKS5 listen address.
pub const DEFAULT_SOCKS_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 1080);

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub overlay_addr: SocketAddr,
    /// `None` disables the SOCKS5 ingress.
    pub socks_addr: Option<SocketAddr>,
    pub bootstrap: Vec<SocketAddr>,
    pub walk_interval: Duration,
    pub tunnel: TunnelConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            overlay_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            socks_addr: Some(DEFAULT_SOCKS_ADDR),
            bootstrap: Vec::new(),
            walk_interval: DEFAULT_WALK_INTERVAL,
            tunnel: TunnelConfig::default(),
        }
    }
}

/// Periodic summary logged by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub local_addr: SocketAddr,
    pub tunnel: TunnelStats,
    pub associations: usize,
}

pub struct Node {
    overlay: Arc<UdpOverlay>,
    tunnel: TunnelCore,
    socks: Option<Socks5Server>,
    overlay_tasks: OverlayTasks,
    deliveries: TakeOnce<Delivery>,
}

impl Node {
    /// Bind the overlay endpoint, start the tunnel core and, if configured,
    /// the SOCKS5 ingress. Bootstrap peers are contacted immediately.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let overlay = UdpOverlay::bind(config.overlay_addr)
            .await
            .with_context(|| format!("failed to bind overlay endpoint on {}", config.overlay_addr))?;
        let local_addr = overlay.local_addr();

        let mut tunnel_config = config.tunnel.clone();
        for peer in &config.bootstrap {
            if !tunnel_config.bootstrap.contains(peer) {
                tunnel_config.bootstrap.push(*peer);
            }
        }
        let (tunnel, deliveries) = TunnelCore::spawn(local_addr, tunnel_config, overlay.clone());
        let overlay_tasks = overlay.start(tunnel.clone(), config.walk_interval);

        let (socks, deliveries) = match config.socks_addr {
            Some(addr) => {
                let server = Socks5Server::bind(addr, tunnel.clone(), deliveries).await?;
                (Some(server), None)
            }
            None => (None, Some(deliveries)),
        };

        for peer in &config.bootstrap {
            if let Err(e) = overlay.introduce_to(*peer).await {
                debug!(peer = %peer, error = %e, "initial introduction failed");
            }
        }

        info!(
            addr = %local_addr,
            socks = ?socks.as_ref().map(|s| s.local_addr()),
            bootstrap = config.bootstrap.len(),
            exit = config.tunnel.exit_enabled,
            "node started"
        );

        Ok(Self {
            overlay,
            tunnel,
            socks,
            overlay_tasks,
            deliveries: tokio::sync::Mutex::new(deliveries),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.overlay.local_addr()
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks.as_ref().map(|s| s.local_addr())
    }

    pub fn tunnel(&self) -> &TunnelCore {
        &self.tunnel
    }

    /// Introduce ourselves to `peer` now rather than on the next walk.
    pub async fn bootstrap(&self, peer: SocketAddr) -> Result<()> {
        self.overlay
            .introduce_to(peer)
            .await
            .with_context(|| format!("failed to contact {}", peer))
    }

    /// Local deliveries, when the SOCKS5 ingress is disabled. Can be taken
    /// once.
    pub async fn deliveries(&self) -> Result<mpsc::Receiver<Delivery>> {
        let mut guard = self.deliveries.lock().await;
        guard
            .take()
            .context("delivery receiver already taken or owned by the SOCKS5 ingress")
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        let associations = match &self.socks {
            Some(server) => server.association_count().await,
            None => 0,
        };
        TelemetrySnapshot {
            local_addr: self.local_addr(),
            tunnel: self.tunnel.stats().await,
            associations,
        }
    }

    pub async fn shutdown(&self) {
        // Stop intake first, then the actor.
        if let Some(server) = &self.socks {
            server.shutdown();
        }
        self.overlay_tasks.abort();
        self.tunnel.quit().await;
    }
}
