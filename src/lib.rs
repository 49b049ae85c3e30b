//! # Veilnet - Onion-Routed UDP Tunnel Overlay
//!
//! Veilnet lets peers tunnel UDP datagrams through multi-hop circuits built
//! from other peers:
//!
//! - **Circuits**: grown one hop at a time (CREATE/CREATED, EXTEND/EXTENDED)
//! - **Relaying**: each hop forwards along mirror bindings keyed by neighbor and circuit id
//! - **Exit**: the tail sends datagrams to their Internet destination and returns replies
//! - **Ingress**: a SOCKS5 UDP ASSOCIATE server feeds local applications into circuits
//! - **Discovery**: an introduction walk keeps the candidate pool of live peers fresh
//!
//! ## Architecture
//!
//! The tunnel core uses the **Actor Pattern**:
//! - `TunnelCore` is a cheap-to-clone handle; `TunnelActor` owns all tunnel state
//! - Overlay receive loop, SOCKS5 associations and exit sockets are separate tasks
//! - They reach the actor only through bounded queues
//!
//! ## Security Model
//!
//! - Cells carry opaque payload; there is no end-to-end encryption
//! - The transport address of a peer is its identifier
//! - Every table is bounded (`MAX_*` constants) against resource exhaustion
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `cell` | Cell wire format |
//! | `candidate` | Live peer pool, heartbeat gating |
//! | `circuit` | Origin-side circuit table and state machine |
//! | `relay` | Forward/backward relay bindings and tail records |
//! | `exit` | Per-circuit exit sockets |
//! | `tunnel` | Tunnel core actor |
//! | `socks5` | SOCKS5 UDP ingress |
//! | `overlay` | UDP endpoint and introduction walk |
//! | `messages` | Introduction frames |
//! | `protocols` | `CellTransport` seam |
//! | `error` | Error taxonomy |

mod candidate;
mod cell;
mod circuit;
mod error;
mod exit;
mod messages;
mod node;
mod overlay;
mod protocols;
mod relay;
mod socks5;
mod tunnel;

pub use candidate::{Candidate, CandidatePool, DEFAULT_CANDIDATE_FRESHNESS, MAX_CANDIDATES};
pub use cell::{Address, BadFrame, CELL_MAGIC, Cell, CellKind, CircuitId, MAX_CELL_SIZE};
pub use circuit::{
    Circuit, CircuitState, CircuitTable, MAX_WAITING_PER_FIRST_HOP, Outbound, generate_circuit_id,
};
pub use error::{CryptoError, TunnelError};
pub use exit::{ExitDatagram, ExitEngine, MAX_EXIT_SOCKETS};
pub use messages::IntroMessage;
pub use node::{DEFAULT_SOCKS_ADDR, Node, NodeConfig, TelemetrySnapshot};
pub use overlay::{DEFAULT_WALK_INTERVAL, OverlayTasks, UdpOverlay};
pub use protocols::{CellTransport, TransportError};
pub use relay::{Direction, HopKey, NeighborLoss, RelayBinding, RelayTable};
pub use socks5::{Socks5Server, SocksError, encode_udp_reply, parse_udp_request};
pub use tunnel::{
    CircuitInfo, DEFAULT_CREATE_TIMEOUT, DEFAULT_RELAY_IDLE_TIMEOUT, Delivery, TunnelConfig, TunnelCore,
    TunnelStats,
};
