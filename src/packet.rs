//! Overlay packet wire codec.
//!
//! Every overlay packet is carried in a single UDP datagram: a 10-byte
//! big-endian fixed header followed by a US-ASCII text payload. The whole
//! datagram is capped at 1400 bytes.
//!
//! ```text
//! [protocol:1][ttl:1][src:4 BE][dest:4 BE][payload:<=1390 ASCII]
//! ```

use crate::addr::OverlayAddr;
use std::fmt;
use thiserror::Error;

/// Maximum total datagram size, header included.
pub const MAX_PACKET_LEN: usize = 1400;

/// Fixed header size.
pub const HEADER_LEN: usize = 10;

/// Maximum payload size.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

/// Initial TTL for locally originated packets.
pub const DEFAULT_TTL: u8 = 99;

/// Errors from packet encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram too short: {got} bytes, need at least {HEADER_LEN}")]
    TooShort { got: usize },

    #[error("packet exceeds {MAX_PACKET_LEN} bytes: {got}")]
    TooLong { got: usize },

    #[error("payload is not US-ASCII")]
    NotAscii,

    #[error("unknown protocol byte {0:#04x}")]
    UnknownProtocol(u8),
}

/// Protocol discriminator in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Application data.
    Data = 1,
    /// Routing protocol traffic.
    Control = 2,
}

impl Protocol {
    /// Decode the header byte; `None` for unassigned values.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Protocol::Data),
            2 => Some(Protocol::Control),
            _ => None,
        }
    }

    /// The wire representation.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A packet in the overlay network.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub protocol: Protocol,
    /// Hops remaining before the packet expires. Unsigned semantics.
    pub ttl: u8,
    pub src: OverlayAddr,
    pub dest: OverlayAddr,
    /// US-ASCII application or protocol payload.
    pub payload: String,
}

impl Packet {
    /// Build an application data packet with the default TTL.
    pub fn data(src: OverlayAddr, dest: OverlayAddr, payload: String) -> Self {
        Self {
            protocol: Protocol::Data,
            ttl: DEFAULT_TTL,
            src,
            dest,
            payload,
        }
    }

    /// Build a routing control packet with the default TTL.
    pub fn control(src: OverlayAddr, dest: OverlayAddr, payload: String) -> Self {
        Self {
            protocol: Protocol::Control,
            ttl: DEFAULT_TTL,
            src,
            dest,
            payload,
        }
    }

    /// Serialize to the wire format.
    ///
    /// Fails if the payload is not US-ASCII or the datagram would exceed
    /// [`MAX_PACKET_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if !self.payload.is_ascii() {
            return Err(WireError::NotAscii);
        }
        let total = HEADER_LEN + self.payload.len();
        if total > MAX_PACKET_LEN {
            return Err(WireError::TooLong { got: total });
        }

        let mut buf = Vec::with_capacity(total);
        buf.push(self.protocol.to_byte());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.src.bits().to_be_bytes());
        buf.extend_from_slice(&self.dest.bits().to_be_bytes());
        buf.extend_from_slice(self.payload.as_bytes());
        Ok(buf)
    }

    /// Deserialize from the wire format.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::TooShort { got: buf.len() });
        }
        if buf.len() > MAX_PACKET_LEN {
            return Err(WireError::TooLong { got: buf.len() });
        }

        let protocol =
            Protocol::from_byte(buf[0]).ok_or(WireError::UnknownProtocol(buf[0]))?;
        let ttl = buf[1];
        // The length checks above make these slices infallible.
        let src = OverlayAddr::from_bits(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]));
        let dest = OverlayAddr::from_bits(u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]));

        let payload = &buf[HEADER_LEN..];
        if !payload.is_ascii() {
            return Err(WireError::NotAscii);
        }
        let payload = String::from_utf8(payload.to_vec()).map_err(|_| WireError::NotAscii)?;

        Ok(Self {
            protocol,
            ttl,
            src,
            dest,
            payload,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol={} ttl={} src={} dest={}\n{}",
            self.protocol.to_byte(),
            self.ttl,
            self.src,
            self.dest,
            self.payload
        )
    }
}
