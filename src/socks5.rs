//! SOCKS5 UDP ASSOCIATE ingress (RFC 1928 subset).
//!
//! Local applications open a TCP control connection, negotiate `NO AUTH`, and
//! issue UDP ASSOCIATE. Each association gets its own UDP relay socket; the
//! client sends encapsulated datagrams there and they are injected into a
//! circuit with the header's destination. Replies coming back through the
//! tunnel are re-wrapped with a header carrying their external origin.
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! An association sticks to the first circuit it used. With no ready circuit
//! it waits for one; it never builds circuits itself. The association ends
//! when its control connection closes.
//!
//! Replies are routed by a small router actor: first by the `(circuit,
//! origin)` flow a client datagram opened, then to the most recent
//! association on that circuit.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::cell::{Address, CircuitId};
use crate::error::TunnelError;
use crate::tunnel::{Delivery, TunnelCore};


// ============================================================================
// Constants
// ============================================================================

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Time allowed for method negotiation and the request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum concurrent associations.
/// SECURITY: Each association holds a UDP socket and a task.
pub const MAX_ASSOCIATIONS: usize = 1_024;

/// Maximum tracked `(circuit, origin)` reply flows.
/// SECURITY: Bounded via LruCache; oldest flows fall back to per-circuit routing.
const MAX_FLOWS: usize = 8_192;

/// Reply datagrams buffered per association before dropping.
const ASSOCIATION_QUEUE: usize = 256;

const ROUTER_QUEUE: usize = 1_024;

const MAX_UDP_PACKET: usize = 65_535;

/// Size of the fixed part of a UDP header: RSV(2) + FRAG(1) + ATYP(1).
const UDP_HEADER_PREFIX: usize = 4;


// ============================================================================
// UDP Header Codec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksError {
    Truncated,
    /// Fragmented datagrams are not supported and are dropped.
    Fragmented(u8),
    UnsupportedAddressType(u8),
    /// A reply origin that cannot be expressed in a SOCKS5 header.
    UnencodableAddress,
}

impl fmt::Display for SocksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksError::Truncated => write!(f, "truncated SOCKS5 UDP header"),
            SocksError::Fragmented(frag) => write!(f, "fragmented datagram (FRAG={})", frag),
            SocksError::UnsupportedAddressType(atyp) => write!(f, "unsupported address type 0x{:02x}", atyp),
            SocksError::UnencodableAddress => write!(f, "address cannot be encoded in a SOCKS5 header"),
        }
    }
}

impl std::error::Error for SocksError {}

/// Parse a client UDP request. Returns the destination and the payload.
pub fn parse_udp_request(data: &[u8]) -> Result<(Address, &[u8]), SocksError> {
    if data.len() < UDP_HEADER_PREFIX {
        return Err(SocksError::Truncated);
    }
    if data[2] != 0 {
        return Err(SocksError::Fragmented(data[2]));
    }
    parse_address(data[3], &data[UDP_HEADER_PREFIX..])
}

fn parse_address(atyp: u8, buf: &[u8]) -> Result<(Address, &[u8]), SocksError> {
    let port_at = |buf: &[u8], at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 6 {
                return Err(SocksError::Truncated);
            }
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let addr = SocketAddr::new(IpAddr::V4(ip), port_at(buf, 4));
            Ok((Address::from(addr), &buf[6..]))
        }
        ATYP_IPV6 => {
            if buf.len() < 18 {
                return Err(SocksError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port_at(buf, 16));
            Ok((Address::from(addr), &buf[18..]))
        }
        ATYP_DOMAIN => {
            let len = *buf.first().ok_or(SocksError::Truncated)? as usize;
            if buf.len() < 1 + len + 2 {
                return Err(SocksError::Truncated);
            }
            let host = buf[1..1 + len].to_vec();
            let port = port_at(buf, 1 + len);
            Ok((Address::new(host, u32::from(port)), &buf[1 + len + 2..]))
        }
        other => Err(SocksError::UnsupportedAddressType(other)),
    }
}

fn put_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Wrap a reply payload in a UDP header whose address is `origin`. An absent
/// origin is written as `0.0.0.0:0`.
pub fn encode_udp_reply(origin: Option<&Address>, payload: &[u8]) -> Result<Vec<u8>, SocksError> {
    let mut buf = Vec::with_capacity(UDP_HEADER_PREFIX + 18 + payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    match origin {
        None => put_socket_addr(&mut buf, SocketAddr::from(([0, 0, 0, 0], 0))),
        Some(addr) => match addr.to_socket_addr() {
            Some(sock) => put_socket_addr(&mut buf, sock),
            None => {
                let port = u16::try_from(addr.port).map_err(|_| SocksError::UnencodableAddress)?;
                let len = u8::try_from(addr.host.len()).map_err(|_| SocksError::UnencodableAddress)?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(&addr.host);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        },
    }
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn reply_bytes(code: u8, bound: SocketAddr) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, code, 0x00];
    put_socket_addr(&mut buf, bound);
    buf
}


// ============================================================================
// Reply Router (actor)
// ============================================================================

type AssociationId = u64;

/// A reply for one association: external origin and payload.
type ClientReply = (Option<Address>, Vec<u8>);

enum RouterCommand {
    Register {
        id: AssociationId,
        tx: mpsc::Sender<ClientReply>,
    },
    Unregister {
        id: AssociationId,
    },
    Flow {
        id: AssociationId,
        circuit_id: CircuitId,
        destination: Address,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

struct Router {
    associations: HashMap<AssociationId, mpsc::Sender<ClientReply>>,
    /// SECURITY: Bounded by MAX_FLOWS.
    flows: LruCache<(CircuitId, Address), AssociationId>,
    /// Live associations that sent on each circuit, most recent last.
    latest: HashMap<CircuitId, Vec<AssociationId>>,
}

impl Router {
    fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_FLOWS).expect("MAX_FLOWS must be non-zero");
        Self {
            associations: HashMap::new(),
            flows: LruCache::new(cap),
            latest: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
        mut deliveries: mpsc::Receiver<Delivery>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                delivery = deliveries.recv() => {
                    match delivery {
                        Some(delivery) => self.route(delivery),
                        None => {
                            debug!("delivery channel closed, SOCKS5 router exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Register { id, tx } => {
                self.associations.insert(id, tx);
            }
            RouterCommand::Unregister { id } => {
                self.associations.remove(&id);
                self.latest.retain(|_, ids| {
                    ids.retain(|assoc| *assoc != id);
                    !ids.is_empty()
                });
                // Stale flows are left to LRU eviction; routing skips them.
            }
            RouterCommand::Flow { id, circuit_id, destination } => {
                self.flows.put((circuit_id, destination), id);
                let ids = self.latest.entry(circuit_id).or_default();
                ids.retain(|assoc| *assoc != id);
                ids.push(id);
            }
            RouterCommand::Count { reply } => {
                let _ = reply.send(self.associations.len());
            }
        }
    }

    fn route(&mut self, delivery: Delivery) {
        let Delivery { circuit_id, origin, payload, .. } = delivery;

        let by_flow = origin
            .as_ref()
            .and_then(|o| self.flows.get(&(circuit_id, o.clone())).copied())
            .filter(|id| self.associations.contains_key(id));
        let latest = self.latest.get(&circuit_id).and_then(|ids| ids.last().copied());
        let Some(id) = by_flow.or(latest) else {
            debug!(circuit = circuit_id, "no association for delivery, dropped");
            return;
        };
        let Some(tx) = self.associations.get(&id) else {
            return;
        };
        if tx.try_send((origin, payload)).is_err() {
            debug!(circuit = circuit_id, association = id, "association queue full, reply dropped");
        }
    }
}


// ============================================================================
// Server
// ============================================================================

/// SOCKS5 front-end. Dropping or shutting down stops the listener and every
/// association.
pub struct Socks5Server {
    local_addr: SocketAddr,
    router_tx: mpsc::Sender<RouterCommand>,
    accept_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
}

impl Socks5Server {
    /// Listen on `addr`. Replies are taken from `deliveries`, the core's local
    /// delivery channel.
    pub async fn bind(
        addr: SocketAddr,
        core: TunnelCore,
        deliveries: mpsc::Receiver<Delivery>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind SOCKS5 listener on {}", addr))?;
        let local_addr = listener.local_addr().context("failed to read SOCKS5 listener address")?;

        let (router_tx, router_rx) = mpsc::channel(ROUTER_QUEUE);
        let router_task = tokio::spawn(Router::new().run(router_rx, deliveries));
        let accept_task = tokio::spawn(run_accept_loop(listener, core, router_tx.clone()));

        info!(addr = %local_addr, "SOCKS5 ingress listening");
        Ok(Self { local_addr, router_tx, accept_task, router_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open associations.
    pub async fn association_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.router_tx.send(RouterCommand::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.router_task.abort();
    }
}

impl Drop for Socks5Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_accept_loop(listener: TcpListener, core: TunnelCore, router_tx: mpsc::Sender<RouterCommand>) {
    let next_id = Arc::new(AtomicU64::new(1));
    // Dropping the set (on abort) aborts every association.
    let mut associations = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, client) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "SOCKS5 accept failed");
                        continue;
                    }
                };
                if associations.len() >= MAX_ASSOCIATIONS {
                    warn!(client = %client, "association limit reached, connection refused");
                    continue;
                }
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let core = core.clone();
                let router_tx = router_tx.clone();
                associations.spawn(async move {
                    if let Err(e) = handle_client(stream, client, id, core, router_tx).await {
                        debug!(client = %client, error = %e, "SOCKS5 session ended with error");
                    }
                });
            }
            Some(_) = associations.join_next(), if !associations.is_empty() => {}
        }
    }
}


// ============================================================================
// Control Connection
// ============================================================================

async fn handle_client(
    mut stream: TcpStream,
    client: SocketAddr,
    id: AssociationId,
    core: TunnelCore,
    router_tx: mpsc::Sender<RouterCommand>,
) -> Result<()> {
    let cmd = tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut stream))
        .await
        .context("SOCKS5 handshake timed out")??;

    let listen_ip = stream.local_addr().context("control socket has no local address")?.ip();
    let unspecified = SocketAddr::new(listen_ip, 0);

    match cmd {
        Some(CMD_UDP_ASSOCIATE) => {}
        Some(other) => {
            debug!(client = %client, command = other, "unsupported SOCKS5 command");
            stream.write_all(&reply_bytes(REPLY_COMMAND_NOT_SUPPORTED, unspecified)).await?;
            return Ok(());
        }
        None => {
            stream.write_all(&reply_bytes(REPLY_ADDRESS_TYPE_NOT_SUPPORTED, unspecified)).await?;
            return Ok(());
        }
    }

    let relay = match UdpSocket::bind(unspecified).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(client = %client, error = %e, "failed to bind UDP relay socket");
            stream.write_all(&reply_bytes(REPLY_GENERAL_FAILURE, unspecified)).await?;
            return Ok(());
        }
    };
    let bound = relay.local_addr().context("UDP relay socket has no local address")?;
    stream.write_all(&reply_bytes(REPLY_SUCCEEDED, bound)).await?;
    info!(client = %client, association = id, relay = %bound, "UDP association opened");

    let (reply_tx, reply_rx) = mpsc::channel(ASSOCIATION_QUEUE);
    router_tx
        .send(RouterCommand::Register { id, tx: reply_tx })
        .await
        .map_err(|_| anyhow::anyhow!("SOCKS5 router closed"))?;

    let association = Association {
        id,
        relay,
        core,
        router_tx: router_tx.clone(),
        client_addr: None,
        circuit_id: None,
    };
    let result = association.run(stream, reply_rx).await;

    let _ = router_tx.send(RouterCommand::Unregister { id }).await;
    info!(client = %client, association = id, "UDP association closed");
    result
}

/// Method negotiation and request. Returns the command, or `None` when the
/// request used an address type we cannot parse.
async fn negotiate(stream: &mut TcpStream) -> Result<Option<u8>> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.context("failed to read greeting")?;
    if greeting[0] != SOCKS_VERSION {
        bail!("not SOCKS5: version 0x{:02x}", greeting[0]);
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await.context("failed to read methods")?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        bail!("client does not offer NO AUTH");
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await.context("failed to read request")?;
    if request[0] != SOCKS_VERSION {
        bail!("bad request version 0x{:02x}", request[0]);
    }
    let cmd = request[1];

    // DST.ADDR/DST.PORT of the request; read and discard.
    let remaining = match request[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Ok(None),
    };
    let mut skip = vec![0u8; remaining];
    stream.read_exact(&mut skip).await.context("failed to read request address")?;
    Ok(Some(cmd))
}


// ============================================================================
// Association
// ============================================================================

struct Association {
    id: AssociationId,
    relay: UdpSocket,
    core: TunnelCore,
    router_tx: mpsc::Sender<RouterCommand>,
    /// Locked to the first sender seen on the relay socket.
    client_addr: Option<SocketAddr>,
    /// Circuit this association sticks to once used.
    circuit_id: Option<CircuitId>,
}

impl Association {
    async fn run(mut self, stream: TcpStream, mut reply_rx: mpsc::Receiver<ClientReply>) -> Result<()> {
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
        let watcher = tokio::spawn(watch_control(stream, closed_tx));
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        let result = loop {
            tokio::select! {
                _ = &mut closed_rx => break Ok(()),
                received = self.relay.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => break Err(anyhow::Error::new(e).context("UDP relay receive failed")),
                    };
                    match self.client_addr {
                        None => self.client_addr = Some(from),
                        Some(client) if client != from => {
                            trace!(association = self.id, from = %from, "datagram from foreign source dropped");
                            continue;
                        }
                        Some(_) => {}
                    }
                    let datagram = buf[..len].to_vec();
                    if !self.forward(&datagram, &mut closed_rx).await {
                        break Ok(());
                    }
                }
                Some((origin, payload)) = reply_rx.recv() => {
                    self.deliver(origin, payload).await;
                }
            }
        };

        watcher.abort();
        result
    }

    /// Inject one client datagram. Returns `false` if the control connection
    /// closed while waiting for a circuit.
    async fn forward(&mut self, datagram: &[u8], closed_rx: &mut oneshot::Receiver<()>) -> bool {
        let (destination, payload) = match parse_udp_request(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(association = self.id, error = %e, "client datagram dropped");
                return true;
            }
        };

        loop {
            let result = self
                .core
                .send_data(payload.to_vec(), Some(destination.clone()), self.circuit_id, None)
                .await;
            match result {
                Ok(circuit_id) => {
                    if self.circuit_id != Some(circuit_id) {
                        debug!(association = self.id, circuit = circuit_id, "association bound to circuit");
                        self.circuit_id = Some(circuit_id);
                    }
                    let flow = RouterCommand::Flow { id: self.id, circuit_id, destination };
                    if self.router_tx.try_send(flow).is_err() {
                        trace!(association = self.id, "router busy, flow not recorded");
                    }
                    return true;
                }
                Err(TunnelError::UnknownCircuit(_) | TunnelError::NoRoute(_)) if self.circuit_id.is_some() => {
                    // The sticky circuit went away; pick another.
                    debug!(association = self.id, circuit = ?self.circuit_id, "circuit lost, reselecting");
                    self.circuit_id = None;
                }
                Err(TunnelError::NoReadyCircuit) => {
                    info!(association = self.id, "no ready circuit, waiting");
                    tokio::select! {
                        ready = self.core.wait_ready() => {
                            if ready.is_err() {
                                return false;
                            }
                        }
                        _ = &mut *closed_rx => return false,
                    }
                }
                Err(e) if e.is_fatal() => {
                    warn!(association = self.id, error = %e, "tunnel core unavailable");
                    return false;
                }
                Err(e) => {
                    debug!(association = self.id, error = %e, "client datagram dropped");
                    return true;
                }
            }
        }
    }

    async fn deliver(&self, origin: Option<Address>, payload: Vec<u8>) {
        let Some(client) = self.client_addr else {
            trace!(association = self.id, "reply before any client datagram, dropped");
            return;
        };
        let packet = match encode_udp_reply(origin.as_ref(), &payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(association = self.id, error = %e, "reply dropped");
                return;
            }
        };
        if let Err(e) = self.relay.send_to(&packet, client).await {
            debug!(association = self.id, error = %e, "reply send failed");
        }
    }
}

/// Resolve `closed` once the control connection reaches EOF or fails.
async fn watch_control(mut stream: TcpStream, closed: oneshot::Sender<()>) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    let _ = closed.send(());
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_request() {
        let mut packet = vec![0, 0, 0, ATYP_IPV4, 203, 0, 113, 1, 0, 9];
        packet.extend_from_slice(b"ping");

        let (dst, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(dst, Address::new("203.0.113.1", 9));
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn test_parse_domain_and_ipv6_requests() {
        let mut packet = vec![0, 0, 0, ATYP_DOMAIN, 11];
        packet.extend_from_slice(b"example.org");
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(b"q");
        let (dst, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(dst, Address::new("example.org", 53));
        assert_eq!(payload, b"q");

        let mut packet = vec![0, 0, 0, ATYP_IPV6];
        packet.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        packet.extend_from_slice(&443u16.to_be_bytes());
        let (dst, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(dst, Address::new("2001:db8::1", 443));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert_eq!(parse_udp_request(&[0, 0, 0]), Err(SocksError::Truncated));
        assert_eq!(
            parse_udp_request(&[0, 0, 1, ATYP_IPV4, 1, 2, 3, 4, 0, 80]),
            Err(SocksError::Fragmented(1))
        );
        assert_eq!(
            parse_udp_request(&[0, 0, 0, 0x09, 1, 2]),
            Err(SocksError::UnsupportedAddressType(0x09))
        );
        assert_eq!(
            parse_udp_request(&[0, 0, 0, ATYP_IPV4, 1, 2, 3]),
            Err(SocksError::Truncated)
        );
        assert_eq!(
            parse_udp_request(&[0, 0, 0, ATYP_DOMAIN, 10, b'a']),
            Err(SocksError::Truncated)
        );
    }

    #[test]
    fn test_encode_reply_headers() {
        let origin = Address::new("198.51.100.7", 5353);
        let packet = encode_udp_reply(Some(&origin), b"pong").unwrap();
        assert_eq!(&packet[..10], &[0, 0, 0, ATYP_IPV4, 198, 51, 100, 7, 0x14, 0xe9]);
        assert_eq!(&packet[10..], b"pong");

        let (parsed, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(parsed, origin);
        assert_eq!(payload, b"pong");

        let packet = encode_udp_reply(None, b"x").unwrap();
        assert_eq!(packet, vec![0, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0, b'x']);

        let named = Address::new("dns.example", 53);
        let packet = encode_udp_reply(Some(&named), b"").unwrap();
        assert_eq!(parse_udp_request(&packet).unwrap().0, named);

        let bad_port = Address::new("dns.example", 70_000);
        assert_eq!(encode_udp_reply(Some(&bad_port), b""), Err(SocksError::UnencodableAddress));
    }

    #[test]
    fn test_router_prefers_flow_then_latest() {
        let mut router = Router::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.handle_command(RouterCommand::Register { id: 1, tx: tx1 });
        router.handle_command(RouterCommand::Register { id: 2, tx: tx2 });

        let dns = Address::new("192.0.2.53", 53);
        let ntp = Address::new("192.0.2.123", 123);
        router.handle_command(RouterCommand::Flow { id: 1, circuit_id: 7, destination: dns.clone() });
        router.handle_command(RouterCommand::Flow { id: 2, circuit_id: 7, destination: ntp.clone() });

        let delivery = |origin: Option<Address>, payload: &[u8]| Delivery {
            circuit_id: 7,
            from: "10.0.0.1:1".parse().unwrap(),
            destination: None,
            origin,
            payload: payload.to_vec(),
        };

        router.route(delivery(Some(dns.clone()), b"a"));
        assert_eq!(rx1.try_recv().unwrap(), (Some(dns), b"a".to_vec()));

        router.route(delivery(Some(Address::new("192.0.2.99", 1)), b"b"));
        assert_eq!(rx2.try_recv().unwrap().1, b"b".to_vec());

        // The flow owner is gone; the circuit's other association takes it.
        router.handle_command(RouterCommand::Unregister { id: 2 });
        router.route(delivery(Some(ntp.clone()), b"c"));
        assert_eq!(rx1.try_recv().unwrap(), (Some(ntp), b"c".to_vec()));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_router_fallback_follows_live_associations() {
        let mut router = Router::new();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (tx, rx) = mpsc::channel(4);
            router.handle_command(RouterCommand::Register { id, tx });
            receivers.push(rx);
        }
        for id in [1, 2, 3, 1] {
            let destination = Address::new("192.0.2.53", 53);
            router.handle_command(RouterCommand::Flow { id, circuit_id: 9, destination });
        }

        let stranger = || Delivery {
            circuit_id: 9,
            from: "10.0.0.1:1".parse().unwrap(),
            destination: None,
            origin: Some(Address::new("192.0.2.99", 1)),
            payload: b"x".to_vec(),
        };

        // Association 1 sent last.
        router.route(stranger());
        assert!(receivers[0].try_recv().is_ok());

        router.handle_command(RouterCommand::Unregister { id: 1 });
        router.route(stranger());
        assert!(receivers[2].try_recv().is_ok());

        router.handle_command(RouterCommand::Unregister { id: 3 });
        router.route(stranger());
        assert!(receivers[1].try_recv().is_ok());

        router.handle_command(RouterCommand::Unregister { id: 2 });
        router.route(stranger());
        assert!(router.latest.is_empty());
        assert!(receivers.iter_mut().all(|rx| rx.try_recv().is_err()));
    }
}
