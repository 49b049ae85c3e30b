//! # Introduction Walk Messages
//!
//! Peers discover one another by walking: a node periodically sends an
//! introduction request to a known peer, which answers with an introduction
//! response naming another peer it knows. Both sides treat the exchange as an
//! inbound introduction of the sender.
//!
//! Introduction frames share the overlay socket with tunnel cells and are told
//! apart by their magic bytes.
//!
//! ```text
//! request:  magic(4) | kind=0x01
//! response: magic(4) | kind=0x02 | family(1) [ | ip(4 or 16) | port(2) ]
//! ```
//!
//! `family` is 0 when no peer is introduced, 4 for IPv4 and 6 for IPv6.
//! Ports are big-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Magic bytes identifying introduction frames.
pub const INTRO_MAGIC: [u8; 4] = *b"VINT";

pub const INTRO_TYPE_REQUEST: u8 = 0x01;

pub const INTRO_TYPE_RESPONSE: u8 = 0x02;

/// Size of the introduction header: magic(4) + type(1).
pub const INTRO_HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroMessage {
    Request,
    Response { introduced: Option<SocketAddr> },
}

impl IntroMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INTRO_HEADER_SIZE + 19);
        buf.extend_from_slice(&INTRO_MAGIC);
        match self {
            IntroMessage::Request => buf.push(INTRO_TYPE_REQUEST),
            IntroMessage::Response { introduced } => {
                buf.push(INTRO_TYPE_RESPONSE);
                match introduced {
                    None => buf.push(0),
                    Some(SocketAddr::V4(addr)) => {
                        buf.push(4);
                        buf.extend_from_slice(&addr.ip().octets());
                        buf.extend_from_slice(&addr.port().to_be_bytes());
                    }
                    Some(SocketAddr::V6(addr)) => {
                        buf.push(6);
                        buf.extend_from_slice(&addr.ip().octets());
                        buf.extend_from_slice(&addr.port().to_be_bytes());
                    }
                }
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if !Self::is_intro(data) {
            return None;
        }
        match data[4] {
            INTRO_TYPE_REQUEST if data.len() == INTRO_HEADER_SIZE => Some(IntroMessage::Request),
            INTRO_TYPE_RESPONSE => {
                let body = &data[INTRO_HEADER_SIZE..];
                let introduced = match body.first()? {
                    0 if body.len() == 1 => None,
                    4 if body.len() == 7 => {
                        let ip = Ipv4Addr::new(body[1], body[2], body[3], body[4]);
                        let port = u16::from_be_bytes([body[5], body[6]]);
                        Some(SocketAddr::new(IpAddr::V4(ip), port))
                    }
                    6 if body.len() == 19 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&body[1..17]);
                        let port = u16::from_be_bytes([body[17], body[18]]);
                        Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
                    }
                    _ => return None,
                };
                Some(IntroMessage::Response { introduced })
            }
            _ => None,
        }
    }

    /// Cheap check used by the receive loop to route a datagram.
    pub fn is_intro(data: &[u8]) -> bool {
        data.len() >= INTRO_HEADER_SIZE && data[0..4] == INTRO_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let bytes = IntroMessage::Request.to_bytes();
        assert_eq!(bytes, b"VINT\x01");
        assert_eq!(IntroMessage::from_bytes(&bytes), Some(IntroMessage::Request));
    }

    #[test]
    fn test_response_variants() {
        let v4: SocketAddr = "198.51.100.4:7001".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:443".parse().unwrap();

        for introduced in [None, Some(v4), Some(v6)] {
            let msg = IntroMessage::Response { introduced };
            assert_eq!(IntroMessage::from_bytes(&msg.to_bytes()), Some(msg));
        }

        let bytes = IntroMessage::Response { introduced: Some(v4) }.to_bytes();
        assert_eq!(&bytes[5..], &[4, 198, 51, 100, 4, 0x1b, 0x59]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(IntroMessage::from_bytes(b"VIN"), None);
        assert_eq!(IntroMessage::from_bytes(b"VINT\x03"), None);
        assert_eq!(IntroMessage::from_bytes(b"VINT\x01\x00"), None);
        assert_eq!(IntroMessage::from_bytes(b"VINT\x02"), None);
        assert_eq!(IntroMessage::from_bytes(b"VINT\x02\x04\x01\x02"), None);
        assert_eq!(IntroMessage::from_bytes(b"VINT\x02\x09"), None);
        assert_eq!(IntroMessage::from_bytes(b"VCEL\x01\x00\x00\x00\x01"), None);
        assert!(!IntroMessage::is_intro(b"VCEL\x01\x00\x00\x00\x01"));
    }
}
