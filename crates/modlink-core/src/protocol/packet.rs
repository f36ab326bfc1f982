//! Packet encoding/decoding
//!
//! Binary control packets share one layout:
//! - 1 byte: opcode
//! - 2 bytes: request id (big-endian), present when a reply is awaited or a
//!   payload follows; 0 means "no reply"
//! - N bytes: payload
//!
//! Replies from the device use opcode 5:
//! - 1 byte: `0x05`
//! - 2 bytes: request id (big-endian)
//! - 2 bytes: result code (signed, big-endian), 0 on success
//! - N bytes: result data

use byteorder::{BigEndian, ByteOrder};

use super::commands::Opcode;
use super::ProtocolError;

/// Size of the reply header (opcode + id + code)
const REPLY_HEADER_SIZE: usize = 5;

/// A binary control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub opcode: u8,
    /// `Some` when a reply is awaited
    pub request_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl ControlPacket {
    /// Encode the packet to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut builder = PacketBuilder::new().command(self.opcode);
        if self.request_id.is_some() || !self.payload.is_empty() {
            builder = builder.u16_be(self.request_id.unwrap_or(0));
        }
        builder.bytes(&self.payload).into_bytes()
    }

    /// Decode a host → device packet
    ///
    /// A zero id slot decodes as `None`. Used by device simulators.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&opcode, rest) = data.split_first().ok_or(ProtocolError::InvalidReply)?;
        if rest.is_empty() {
            return Ok(Self {
                opcode,
                request_id: None,
                payload: Vec::new(),
            });
        }
        if rest.len() < 2 {
            return Err(ProtocolError::InvalidReply);
        }
        let id = BigEndian::read_u16(&rest[0..2]);
        Ok(Self {
            opcode,
            request_id: (id != 0).then_some(id),
            payload: rest[2..].to_vec(),
        })
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        let slot = if self.request_id.is_some() || !self.payload.is_empty() {
            2
        } else {
            0
        };
        1 + slot + self.payload.len()
    }
}

/// A device reply to a binary request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: u16,
    /// 0 on success
    pub code: i16,
    pub data: Vec<u8>,
}

impl Reply {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < REPLY_HEADER_SIZE || data[0] != Opcode::Reply.byte() {
            return Err(ProtocolError::InvalidReply);
        }
        Ok(Self {
            id: BigEndian::read_u16(&data[1..3]),
            code: BigEndian::read_i16(&data[3..5]),
            data: data[REPLY_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        PacketBuilder::new()
            .command(Opcode::Reply.byte())
            .u16_be(self.id)
            .i16_be(self.code)
            .bytes(&self.data)
            .into_bytes()
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Reply data as a string, up to the first NUL
    pub fn text(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

/// Builder for constructing packets
pub struct PacketBuilder {
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Create a new packet builder
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
        }
    }

    /// Add a command byte
    pub fn command(mut self, cmd: u8) -> Self {
        self.payload.push(cmd);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a signed 16-bit value (big-endian)
    pub fn i16_be(mut self, value: i16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_i16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (big-endian)
    pub fn u32_be(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Add a string followed by a NUL byte
    pub fn nul_terminated(mut self, value: &str) -> Self {
        self.payload.extend_from_slice(value.as_bytes());
        self.payload.push(0);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_without_payload_or_reply() {
        let packet = ControlPacket {
            opcode: 1,
            request_id: None,
            payload: vec![],
        };
        assert_eq!(packet.to_bytes(), vec![1]);
        assert_eq!(packet.encoded_size(), 1);
    }

    #[test]
    fn test_packet_from_bytes() {
        let decoded = ControlPacket::from_bytes(&[3, 0x12, 0x34, 0, 0, 0, 0, 9]).unwrap();
        assert_eq!(decoded.opcode, 3);
        assert_eq!(decoded.request_id, Some(0x1234));
        assert_eq!(decoded.payload, vec![0, 0, 0, 0, 9]);

        let decoded = ControlPacket::from_bytes(&[4, 0, 0, b'a', 0]).unwrap();
        assert_eq!(decoded.request_id, None);

        assert!(ControlPacket::from_bytes(&[]).is_err());
        assert!(ControlPacket::from_bytes(&[2, 1]).is_err());
    }

    #[test]
    fn test_reply_decode() {
        let reply = Reply::from_bytes(&[5, 0x00, 0x2A, 0xFF, 0xFE, b'o', b'k']).unwrap();
        assert_eq!(reply.id, 42);
        assert_eq!(reply.code, -2);
        assert_eq!(reply.data, b"ok".to_vec());
        assert!(!reply.is_success());
    }

    #[test]
    fn test_reply_rejects_short_or_foreign_frames() {
        assert!(matches!(
            Reply::from_bytes(&[5, 0, 1, 0]),
            Err(ProtocolError::InvalidReply)
        ));
        assert!(matches!(
            Reply::from_bytes(&[6, 0, 1, 0, 0]),
            Err(ProtocolError::InvalidReply)
        ));
    }

    #[test]
    fn test_reply_text_stops_at_nul() {
        let reply = Reply {
            id: 1,
            code: 0,
            data: b"debug\0junk".to_vec(),
        };
        assert_eq!(reply.text(), "debug");
        assert_eq!(Reply::from_bytes(&reply.to_bytes()).unwrap(), reply);
    }

    #[test]
    fn test_packet_builder() {
        let bytes = PacketBuilder::new()
            .command(b'R')
            .u16_be(0x0102)
            .u32_be(128)
            .nul_terminated("x")
            .into_bytes();
        assert_eq!(bytes, vec![b'R', 1, 2, 0, 0, 0, 128, b'x', 0]);
    }
}
