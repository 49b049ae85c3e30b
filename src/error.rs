//! Error taxonomy for tunnel processing.
//!
//! Every error except [`TunnelError::Fatal`] is local to a single cell or
//! datagram: it is logged, counted, and the offending input is dropped.

use std::fmt;
use std::io;

use crate::cell::{BadFrame, CircuitId};

#[derive(Debug)]
pub enum TunnelError {
    /// The datagram did not decode as a cell.
    BadFrame(BadFrame),
    /// No local circuit, relay binding or tail record matches the cell.
    UnknownCircuit(CircuitId),
    /// The cell is well-formed but not valid in the circuit's current state.
    ProtocolViolation(&'static str),
    /// DATA arrived at a tail that has no way to forward it.
    NoRoute(CircuitId),
    /// Local traffic was submitted while no circuit is ready.
    NoReadyCircuit,
    /// A socket operation failed or a queue was full.
    Transient(io::Error),
    /// The overlay endpoint is unusable; the core stops.
    Fatal(String),
}

impl TunnelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Fatal(_))
    }

    /// Short label used as the `reason` field in drop logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::BadFrame(_) => "bad_frame",
            TunnelError::UnknownCircuit(_) => "unknown_circuit",
            TunnelError::ProtocolViolation(_) => "protocol_violation",
            TunnelError::NoRoute(_) => "no_route",
            TunnelError::NoReadyCircuit => "no_ready_circuit",
            TunnelError::Transient(_) => "transient",
            TunnelError::Fatal(_) => "fatal",
        }
    }

    pub(crate) fn queue_full(what: &str) -> Self {
        TunnelError::Transient(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("{} queue full", what),
        ))
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::BadFrame(e) => write!(f, "{}", e),
            TunnelError::UnknownCircuit(id) => write!(f, "unknown circuit {}", id),
            TunnelError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            TunnelError::NoRoute(id) => write!(f, "no route for data on circuit {}", id),
            TunnelError::NoReadyCircuit => write!(f, "no ready circuit"),
            TunnelError::Transient(e) => write!(f, "transient I/O failure: {}", e),
            TunnelError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelError::BadFrame(e) => Some(e),
            TunnelError::Transient(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BadFrame> for TunnelError {
    fn from(err: BadFrame) -> Self {
        TunnelError::BadFrame(err)
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::Transient(err)
    }
}

/// Failure of the system random source while drawing circuit identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: Option<u32>,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

impl From<CryptoError> for TunnelError {
    fn from(err: CryptoError) -> Self {
        TunnelError::Fatal(err.to_string())
    }
}
