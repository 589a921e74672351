//! ArtDMX-style control packets
//!
//! ```text
//! offset  size  field
//!      0     8  "Art-Net\0"
//!      8     2  opcode (0x5000, little-endian)
//!     10     2  protocol version (14, big-endian)
//!     12     1  sequence
//!     13     1  physical (always 0)
//!     14     2  universe (little-endian)
//!     16     2  payload length (big-endian)
//!     18     …  payload: (flag, value) byte pairs
//! ```

use crate::error::{Error, Result};

/// Standard Art-Net UDP port
pub const ARTNET_PORT: u16 = 6454;

pub const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
pub const OP_DMX: u16 = 0x5000;
pub const PROTOCOL_VERSION: u16 = 14;
pub const HEADER_LEN: usize = 18;

/// One control packet addressed to a single controller
#[derive(Debug, Clone, PartialEq)]
pub struct DmxPacket {
    pub sequence: u8,
    pub physical: u8,
    pub universe: u16,
    /// `(flag, value)` per actuator. The flag is carried for compatibility
    /// with the controller firmware and always goes out as 0.
    pub channels: Vec<(bool, f64)>,
}

impl DmxPacket {
    pub fn new(universe: u16, sequence: u8, channels: Vec<(bool, f64)>) -> Self {
        Self {
            sequence,
            physical: 0,
            universe,
            channels,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_len = (self.channels.len() * 2) as u16;
        let mut out = Vec::with_capacity(HEADER_LEN + payload_len as usize);

        out.extend_from_slice(ARTNET_ID);
        out.extend_from_slice(&OP_DMX.to_le_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.push(self.sequence);
        out.push(self.physical);
        out.extend_from_slice(&self.universe.to_le_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());

        for &(_, value) in &self.channels {
            out.push(0);
            out.push(channel_byte(value));
        }
        out
    }

    /// Decode a packet; flags come back as `false`, values as whole numbers
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Protocol(format!("Packet too short: {} bytes", bytes.len())));
        }
        if &bytes[..8] != ARTNET_ID {
            return Err(Error::Protocol("Missing Art-Net identifier".to_string()));
        }
        let opcode = u16::from_le_bytes([bytes[8], bytes[9]]);
        if opcode != OP_DMX {
            return Err(Error::Protocol(format!("Unexpected opcode {:#06x}", opcode)));
        }

        let payload_len = u16::from_be_bytes([bytes[16], bytes[17]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != payload_len || payload_len % 2 != 0 {
            return Err(Error::Protocol(format!(
                "Payload length {} does not match header {}",
                payload.len(),
                payload_len
            )));
        }

        Ok(Self {
            sequence: bytes[12],
            physical: bytes[13],
            universe: u16::from_le_bytes([bytes[14], bytes[15]]),
            channels: payload
                .chunks_exact(2)
                .map(|pair| (pair[0] != 0, pair[1] as f64))
                .collect(),
        })
    }
}

/// Round to the nearest integer and saturate into a byte
fn channel_byte(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as u8
}
