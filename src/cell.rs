//! # Tunnel Cell Codec
//!
//! Cells are the framed control and data messages exchanged between hops of a
//! circuit. Each cell travels as a single UDP datagram on the overlay endpoint,
//! so the framing is not self-delimiting within a stream.
//!
//! ## Frame Layout
//!
//! ```text
//! +-------+------+------------------------------+
//! | magic | kind |             body             |
//! +-------+------+------------------------------+
//! |   4   |  1   |           variable           |
//! +-------+------+------------------------------+
//! ```
//!
//! All integers are big-endian and all lengths are 32-bit unsigned.
//!
//! | Kind | Body |
//! |------|------|
//! | CREATE / CREATED | `u32 circuit_id` |
//! | EXTEND / EXTENDED | `u32 circuit_id`, `u32 host_len`, host, `u32 port` |
//! | DATA | `u32 circuit_id`, destination address, origin address, `u32 payload_len`, payload |
//!
//! An address is `u32 host_len`, host bytes, `u32 port`. Host bytes are opaque:
//! the codec never interprets their encoding. The literal `("0.0.0.0", 0)` is
//! the wire form of an absent DATA destination or origin.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Magic bytes identifying tunnel cells on the overlay endpoint.
pub const CELL_MAGIC: [u8; 4] = *b"VCEL";

/// Size of the frame header: magic(4) + kind(1).
pub const CELL_HEADER_SIZE: usize = 5;

/// Largest cell that fits in a single UDP datagram.
pub const MAX_CELL_SIZE: usize = 65_507;

/// Host bytes used on the wire for an absent address.
pub const NULL_HOST: &[u8] = b"0.0.0.0";

/// Circuit identifier. Unique at the origin only; never rewritten between hops.
pub type CircuitId = u32;


// ============================================================================
// Address
// ============================================================================

/// A host/port pair as carried inside cells.
///
/// The host is an opaque byte string (an IP literal or a domain name supplied
/// by the SOCKS5 client). The port is 32 bits wide on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Vec<u8>,
    pub port: u32,
}

impl Address {
    pub fn new(host: impl Into<Vec<u8>>, port: u32) -> Self {
        Self { host: host.into(), port }
    }

    /// The wire representation of "no address".
    pub fn null() -> Self {
        Self::new(NULL_HOST, 0)
    }

    pub fn is_null(&self) -> bool {
        self.port == 0 && self.host == NULL_HOST
    }

    /// Interpret the address as a socket address.
    ///
    /// Returns `None` when the host is not a textual IP literal or the port
    /// does not fit in 16 bits. Domain names must be resolved separately.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::try_from(self.port).ok()?;
        let host = std::str::from_utf8(&self.host).ok()?;
        let ip: IpAddr = host.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }

    /// Host as UTF-8 text, if it is valid UTF-8.
    pub fn host_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.host).ok()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), u32::from(addr.port()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_str() {
            Some(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, "hex:{}:{}", hex::encode(&self.host), self.port),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}


// ============================================================================
// Cells
// ============================================================================

/// Discriminant of a cell on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellKind {
    Create = 0x01,
    Created = 0x02,
    Extend = 0x03,
    Extended = 0x04,
    Data = 0x05,
}

impl CellKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Create),
            0x02 => Some(Self::Created),
            0x03 => Some(Self::Extend),
            0x04 => Some(Self::Extended),
            0x05 => Some(Self::Data),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Created => "CREATED",
            Self::Extend => "EXTEND",
            Self::Extended => "EXTENDED",
            Self::Data => "DATA",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// Origin → first hop: "open circuit `circuit_id` with me".
    Create { circuit_id: CircuitId },
    /// Answer to CREATE, travels one hop back.
    Created { circuit_id: CircuitId },
    /// "Append `target` to the circuit."
    Extend { circuit_id: CircuitId, target: Address },
    /// Answer to EXTEND, propagated back to the origin.
    Extended { circuit_id: CircuitId, joined: Address },
    /// Opaque datagram. `destination` is the ultimate peer outside the tunnel
    /// (`None` lets the exit choose or marks a reply); `origin` is the external
    /// source of reply traffic.
    Data {
        circuit_id: CircuitId,
        destination: Option<Address>,
        origin: Option<Address>,
        payload: Vec<u8>,
    },
}

impl Cell {
    pub fn kind(&self) -> CellKind {
        match self {
            Cell::Create { .. } => CellKind::Create,
            Cell::Created { .. } => CellKind::Created,
            Cell::Extend { .. } => CellKind::Extend,
            Cell::Extended { .. } => CellKind::Extended,
            Cell::Data { .. } => CellKind::Data,
        }
    }

    pub fn circuit_id(&self) -> CircuitId {
        match self {
            Cell::Create { circuit_id }
            | Cell::Created { circuit_id }
            | Cell::Extend { circuit_id, .. }
            | Cell::Extended { circuit_id, .. }
            | Cell::Data { circuit_id, .. } => *circuit_id,
        }
    }

    /// Encode the cell into a single datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&CELL_MAGIC);
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&self.circuit_id().to_be_bytes());

        match self {
            Cell::Create { .. } | Cell::Created { .. } => {}
            Cell::Extend { target: addr, .. } | Cell::Extended { joined: addr, .. } => {
                put_address(&mut buf, addr);
            }
            Cell::Data { destination, origin, payload, .. } => {
                put_optional_address(&mut buf, destination.as_ref());
                put_optional_address(&mut buf, origin.as_ref());
                put_u32(&mut buf, payload.len() as u32);
                buf.extend_from_slice(payload);
            }
        }
        buf
    }

    /// Decode a datagram into a cell.
    pub fn decode(data: &[u8]) -> Result<Cell, BadFrame> {
        let mut reader = FrameReader::new(data);

        if reader.take(CELL_MAGIC.len())? != CELL_MAGIC {
            return Err(BadFrame::BadMagic);
        }
        let tag = reader.u8()?;
        let kind = CellKind::from_u8(tag).ok_or(BadFrame::UnknownKind(tag))?;
        let circuit_id = reader.u32()?;

        let cell = match kind {
            CellKind::Create => Cell::Create { circuit_id },
            CellKind::Created => Cell::Created { circuit_id },
            CellKind::Extend => Cell::Extend {
                circuit_id,
                target: reader.address()?,
            },
            CellKind::Extended => Cell::Extended {
                circuit_id,
                joined: reader.address()?,
            },
            CellKind::Data => {
                let destination = reader.optional_address()?;
                let origin = reader.optional_address()?;
                let payload_len = reader.u32()? as usize;
                let payload = reader.take(payload_len)?.to_vec();
                Cell::Data { circuit_id, destination, origin, payload }
            }
        };

        reader.finish()?;
        Ok(cell)
    }

    fn encoded_len(&self) -> usize {
        let address_len = |addr: Option<&Address>| 8 + addr.map_or(NULL_HOST.len(), |a| a.host.len());
        CELL_HEADER_SIZE
            + 4
            + match self {
                Cell::Create { .. } | Cell::Created { .. } => 0,
                Cell::Extend { target: addr, .. } | Cell::Extended { joined: addr, .. } => {
                    address_len(Some(addr))
                }
                Cell::Data { destination, origin, payload, .. } => {
                    address_len(destination.as_ref()) + address_len(origin.as_ref()) + 4 + payload.len()
                }
            }
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_address(buf: &mut Vec<u8>, addr: &Address) {
    put_u32(buf, addr.host.len() as u32);
    buf.extend_from_slice(&addr.host);
    put_u32(buf, addr.port);
}

fn put_optional_address(buf: &mut Vec<u8>, addr: Option<&Address>) {
    match addr {
        Some(addr) => put_address(buf, addr),
        None => put_address(buf, &Address::null()),
    }
}


// ============================================================================
// Decoding
// ============================================================================

/// Reason a datagram could not be decoded as a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadFrame {
    /// A field (or a length prefix) would read past the end of the buffer.
    Truncated { needed: usize, available: usize },
    /// The datagram does not start with [`CELL_MAGIC`].
    BadMagic,
    /// The kind tag is not a known cell type.
    UnknownKind(u8),
    /// Bytes remain after the body; the length prefixes do not add up.
    TrailingBytes(usize),
}

impl fmt::Display for BadFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadFrame::Truncated { needed, available } => {
                write!(f, "bad frame: need {} bytes, {} available", needed, available)
            }
            BadFrame::BadMagic => write!(f, "bad frame: missing cell magic"),
            BadFrame::UnknownKind(tag) => write!(f, "bad frame: unknown cell kind 0x{:02x}", tag),
            BadFrame::TrailingBytes(n) => write!(f, "bad frame: {} trailing bytes", n),
        }
    }
}

impl std::error::Error for BadFrame {}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    // Bounds are checked before slicing, so a hostile length prefix can
    // neither panic nor drive an allocation.
    fn take(&mut self, len: usize) -> Result<&'a [u8], BadFrame> {
        if len > self.remaining() {
            return Err(BadFrame::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BadFrame> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BadFrame> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn address(&mut self) -> Result<Address, BadFrame> {
        let host_len = self.u32()? as usize;
        let host = self.take(host_len)?.to_vec();
        let port = self.u32()?;
        Ok(Address { host, port })
    }

    fn optional_address(&mut self) -> Result<Option<Address>, BadFrame> {
        let addr = self.address()?;
        Ok(if addr.is_null() { None } else { Some(addr) })
    }

    fn finish(self) -> Result<(), BadFrame> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(BadFrame::TrailingBytes(n)),
        }
    }
}


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cells() -> Vec<Cell> {
        vec![
            Cell::Create { circuit_id: 7 },
            Cell::Created { circuit_id: u32::MAX },
            Cell::Extend {
                circuit_id: 42,
                target: Address::new("10.0.0.3", 7000),
            },
            Cell::Extended {
                circuit_id: 42,
                joined: Address::new("::1", 7001),
            },
            Cell::Data {
                circuit_id: 42,
                destination: Some(Address::new("203.0.113.1", 9)),
                origin: None,
                payload: b"ping".to_vec(),
            },
            Cell::Data {
                circuit_id: 1,
                destination: None,
                origin: Some(Address::new("example.org", 53)),
                payload: Vec::new(),
            },
        ]
    }

    #[test]
    fn test_decode_inverts_encode() {
        for cell in sample_cells() {
            let encoded = cell.encode();
            assert_eq!(encoded.len(), cell.encoded_len(), "length hint for {:?}", cell.kind());
            assert_eq!(Cell::decode(&encoded), Ok(cell));
        }
    }

    #[test]
    fn test_every_truncation_is_bad_frame() {
        for cell in sample_cells() {
            let encoded = cell.encode();
            for len in 0..encoded.len() {
                let result = Cell::decode(&encoded[..len]);
                assert!(
                    matches!(result, Err(BadFrame::Truncated { .. }) | Err(BadFrame::BadMagic)),
                    "{} truncated to {} bytes decoded as {:?}",
                    cell.kind(),
                    len,
                    result
                );
            }
        }
    }

    #[test]
    fn test_create_layout_is_big_endian() {
        let encoded = Cell::Create { circuit_id: 0x0102_0304 }.encode();
        assert_eq!(&encoded[..4], b"VCEL");
        assert_eq!(encoded[4], 0x01);
        assert_eq!(&encoded[5..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_null_addresses_use_literal_encoding() {
        let cell = Cell::Data {
            circuit_id: 5,
            destination: None,
            origin: None,
            payload: b"x".to_vec(),
        };
        let encoded = cell.encode();

        let mut expected_null = Vec::new();
        expected_null.extend_from_slice(&7u32.to_be_bytes());
        expected_null.extend_from_slice(b"0.0.0.0");
        expected_null.extend_from_slice(&0u32.to_be_bytes());

        let body = &encoded[CELL_HEADER_SIZE + 4..];
        assert_eq!(&body[..15], &expected_null[..]);
        assert_eq!(&body[15..30], &expected_null[..]);

        // An explicit 0.0.0.0:0 on the wire decodes to the absent value.
        let explicit = Cell::Data {
            circuit_id: 5,
            destination: Some(Address::null()),
            origin: Some(Address::null()),
            payload: b"x".to_vec(),
        };
        assert_eq!(explicit.encode(), encoded);
        match Cell::decode(&encoded).unwrap() {
            Cell::Data { destination, origin, .. } => {
                assert!(destination.is_none());
                assert!(origin.is_none());
            }
            other => panic!("unexpected cell {:?}", other),
        }
    }

    #[test]
    fn test_zero_port_with_real_host_is_not_null() {
        let addr = Address::new("10.1.1.1", 0);
        assert!(!addr.is_null());
        let cell = Cell::Data {
            circuit_id: 9,
            destination: Some(addr.clone()),
            origin: None,
            payload: vec![],
        };
        match Cell::decode(&cell.encode()).unwrap() {
            Cell::Data { destination, .. } => assert_eq!(destination, Some(addr)),
            other => panic!("unexpected cell {:?}", other),
        }
    }

    #[test]
    fn test_host_bytes_are_opaque() {
        let cell = Cell::Extend {
            circuit_id: 3,
            target: Address::new(vec![0xff, 0x00, 0xfe, 0x80], 65_536),
        };
        let decoded = Cell::decode(&cell.encode()).unwrap();
        assert_eq!(decoded, cell);
        match decoded {
            Cell::Extend { target, .. } => {
                assert!(target.host_str().is_none());
                assert!(target.to_socket_addr().is_none());
                assert_eq!(target.to_string(), "hex:ff00fe80:65536");
            }
            other => panic!("unexpected cell {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_kind_and_magic() {
        let mut encoded = Cell::Created { circuit_id: 1 }.encode();
        encoded[4] = 0x7f;
        assert_eq!(Cell::decode(&encoded), Err(BadFrame::UnknownKind(0x7f)));

        let mut encoded = Cell::Created { circuit_id: 1 }.encode();
        encoded[0] = b'X';
        assert_eq!(Cell::decode(&encoded), Err(BadFrame::BadMagic));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut encoded = Cell::Create { circuit_id: 1 }.encode();
        encoded.push(0);
        assert_eq!(Cell::decode(&encoded), Err(BadFrame::TrailingBytes(1)));
    }

    #[test]
    fn test_oversized_length_prefix_does_not_panic() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&CELL_MAGIC);
        frame.push(CellKind::Extend as u8);
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(b"short");

        assert_eq!(
            Cell::decode(&frame),
            Err(BadFrame::Truncated { needed: u32::MAX as usize, available: 5 })
        );
    }

    #[test]
    fn test_address_socket_conversion() {
        let v4: SocketAddr = "192.0.2.7:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();

        assert_eq!(Address::from(v4).to_socket_addr(), Some(v4));
        assert_eq!(Address::from(v6).to_socket_addr(), Some(v6));
        assert_eq!(Address::from(v6).to_string(), "[2001:db8::1]:53");
        assert!(Address::new("example.org", 80).to_socket_addr().is_none());
        assert!(Address::new("192.0.2.7", 70_000).to_socket_addr().is_none());
    }
}
