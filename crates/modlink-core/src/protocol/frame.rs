//! USB byte-stream reassembly
//!
//! The USB link carries a plain byte stream, so message boundaries have to be
//! recovered from the content. The device announces each message with a
//! processing-instruction marker followed by CRLF:
//!
//! ```text
//! <?xs.0000ABCD?>\r\n<xsbug>...</xsbug>\r\n     text message for machine 0xABCD
//! <?xs#0000ABCD?>\r\n[len:2 BE][payload]       binary frame for machine 0xABCD
//! <?xs-0000ABCD?>\r\n                          machine 0xABCD went away
//! ```
//!
//! Bytes outside of a marked message (console noise, partial lines) are
//! dropped. CRLF pairs inside message content are not boundaries.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use super::{ProtocolError, CRLF, MAX_BINARY_MESSAGE};

/// Identifier of one XS machine on the device
pub type MachineId = u32;

/// `<?xs` + flag + 8 hex digits + `?>`
const MARKER_LEN: usize = 15;
const MARKER_PREFIX: &[u8] = b"<?xs";
const MARKER_SUFFIX: &[u8] = b"?>";
const OPEN_ROOT: &[u8] = b"<xsbug";
const CLOSE_ROOT: &[u8] = b"</xsbug>";

/// A complete unit recovered from the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An xsbug markup message (without the trailing CRLF)
    Text {
        machine: Option<MachineId>,
        body: String,
    },
    /// A length-prefixed binary payload (without the length)
    Binary {
        machine: Option<MachineId>,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Machine the frame was addressed from
    pub fn machine(&self) -> Option<MachineId> {
        match self {
            Frame::Text { machine, .. } | Frame::Binary { machine, .. } => *machine,
        }
    }

    /// Drop the framing information
    pub fn into_message(self) -> WireMessage {
        match self {
            Frame::Text { body, .. } => WireMessage::Text(body),
            Frame::Binary { payload, .. } => WireMessage::Binary(payload),
        }
    }
}

/// A message as exchanged with a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerFlag {
    Text,
    Binary,
    Ended,
}

impl MarkerFlag {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'.' => Some(MarkerFlag::Text),
            b'#' => Some(MarkerFlag::Binary),
            b'-' => Some(MarkerFlag::Ended),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            MarkerFlag::Text => b'.',
            MarkerFlag::Binary => b'#',
            MarkerFlag::Ended => b'-',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeMode {
    /// Scanning for CRLF-terminated markers and closing root tags
    Text,
    /// Collecting a length-prefixed frame; the length is known after two bytes
    Binary { expected: Option<usize> },
}

/// Reassembles frames from arbitrarily split USB reads
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    mode: DecodeMode,
    machine: Option<MachineId>,
}

impl FrameDecoder {
    /// Create an empty decoder in text mode
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            mode: DecodeMode::Text,
            machine: None,
        }
    }

    /// Machine id announced by the most recent marker
    pub fn machine(&self) -> Option<MachineId> {
        self.machine
    }

    /// Number of bytes waiting for a boundary
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk and collect every frame it completes, in order
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter()
            .filter_map(|&byte| self.push_byte(byte))
            .collect()
    }

    /// Advance the state machine by one byte
    pub fn push_byte(&mut self, byte: u8) -> Option<Frame> {
        self.buffer.push(byte);
        match self.mode {
            DecodeMode::Binary { expected } => self.advance_binary(expected),
            DecodeMode::Text => self.advance_text(),
        }
    }

    fn advance_binary(&mut self, expected: Option<usize>) -> Option<Frame> {
        let expected = match expected {
            Some(length) => length,
            None if self.buffer.len() == 2 => {
                let length = BigEndian::read_u16(&self.buffer[..2]) as usize;
                self.mode = DecodeMode::Binary {
                    expected: Some(length),
                };
                length
            }
            None => return None,
        };

        if self.buffer.len() < 2 + expected {
            return None;
        }

        let payload = self.buffer[2..].to_vec();
        self.reset();
        Some(Frame::Binary {
            machine: self.machine,
            payload,
        })
    }

    fn advance_text(&mut self) -> Option<Frame> {
        if !self.buffer.ends_with(CRLF) {
            return None;
        }
        let end = self.buffer.len() - CRLF.len();

        if let Some((flag, machine)) = parse_marker(&self.buffer[..end]) {
            let stray = end - MARKER_LEN;
            if stray > 0 {
                trace!(bytes = stray, "dropping bytes before marker");
            }
            self.enter(flag, machine);
            return None;
        }

        if self.buffer[..end].ends_with(CLOSE_ROOT) {
            let Some(start) = find(&self.buffer[..end], OPEN_ROOT) else {
                // tail of a message whose start was never seen
                trace!(bytes = self.buffer.len(), "dropping message without opening tag");
                self.reset();
                return None;
            };
            if start > 0 {
                trace!(bytes = start, "dropping bytes before message");
            }
            let body = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            self.reset();
            return Some(Frame::Text {
                machine: self.machine,
                body,
            });
        }

        // CRLF inside content
        None
    }

    fn enter(&mut self, flag: MarkerFlag, machine: MachineId) {
        self.buffer.clear();
        match flag {
            MarkerFlag::Text => {
                self.machine = Some(machine);
                self.mode = DecodeMode::Text;
            }
            MarkerFlag::Binary => {
                self.machine = Some(machine);
                self.mode = DecodeMode::Binary { expected: None };
            }
            MarkerFlag::Ended => {
                debug!(machine = %format!("{machine:08X}"), "machine ended");
                if self.machine == Some(machine) {
                    self.machine = None;
                }
                self.mode = DecodeMode::Text;
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.mode = DecodeMode::Text;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Recognise a marker at the end of `data`
fn parse_marker(data: &[u8]) -> Option<(MarkerFlag, MachineId)> {
    if data.len() < MARKER_LEN {
        return None;
    }
    let tag = &data[data.len() - MARKER_LEN..];
    if !tag.starts_with(MARKER_PREFIX) || !tag.ends_with(MARKER_SUFFIX) {
        return None;
    }
    let flag = MarkerFlag::from_byte(tag[4])?;
    let hex = std::str::from_utf8(&tag[5..13]).ok()?;
    let machine = u32::from_str_radix(hex, 16).ok()?;
    Some((flag, machine))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn put_marker(dst: &mut BytesMut, flag: MarkerFlag, machine: MachineId) {
    dst.put_slice(CRLF);
    dst.put_slice(MARKER_PREFIX);
    dst.put_u8(flag.as_byte());
    dst.put_slice(format!("{machine:08X}").as_bytes());
    dst.put_slice(MARKER_SUFFIX);
}

/// [`FrameDecoder`] as a `tokio_util` codec, plus outbound USB framing
///
/// Outbound text is addressed to the machine announced last; binary messages
/// get a binary marker and a big-endian length prefix.
#[derive(Debug, Default)]
pub struct UsbFrameCodec {
    decoder: FrameDecoder,
}

impl UsbFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Machine id outbound messages are addressed to
    pub fn machine(&self) -> Option<MachineId> {
        self.decoder.machine()
    }
}

impl Decoder for UsbFrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let mut consumed = 0;
        let mut frame = None;
        for &byte in src.iter() {
            consumed += 1;
            if let Some(complete) = self.decoder.push_byte(byte) {
                frame = Some(complete);
                break;
            }
        }
        src.advance(consumed);
        Ok(frame)
    }
}

impl Encoder<WireMessage> for UsbFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let machine = self.decoder.machine();
        match item {
            WireMessage::Text(text) => {
                if let Some(machine) = machine {
                    put_marker(dst, MarkerFlag::Text, machine);
                }
                dst.put_slice(text.as_bytes());
            }
            WireMessage::Binary(payload) => {
                let length = u16::try_from(payload.len()).map_err(|_| {
                    ProtocolError::MessageTooLarge {
                        size: payload.len(),
                        limit: MAX_BINARY_MESSAGE,
                    }
                })?;
                put_marker(dst, MarkerFlag::Binary, machine.unwrap_or(0));
                dst.put_slice(CRLF);
                dst.put_u16(length);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}
