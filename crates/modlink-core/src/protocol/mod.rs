//! xsbug Protocol Communication
//!
//! Implements the XS runtime's device protocol: the textual xsbug debugger
//! messages and the binary control channel that shares the same link.
//!
//! Text and binary traffic are multiplexed on one connection. Over WebSocket
//! the framing is provided by the socket; over USB the byte stream is
//! reassembled by [`FrameDecoder`].

pub mod commands;
mod connection;
pub mod correlator;
mod error;
pub mod events;
pub mod frame;
pub mod installer;
pub mod message;
pub mod packet;
pub mod types;

pub use commands::{ControlCommand, DebugCommand, Opcode};
pub use connection::{ConnectionManager, ConnectionState, ReadySignal};
pub use correlator::RequestCorrelator;
pub use error::ProtocolError;
pub use events::{ConnectionEvent, EventHandler, EventStream};
pub use frame::{Frame, FrameDecoder, MachineId, UsbFrameCodec, WireMessage};
pub use installer::{plan_chunks, FirmwareInstaller, InstallProgress, ReplyChannel};
pub use message::parse_message;
pub use packet::{ControlPacket, PacketBuilder, Reply};
pub use types::{
    group_instruments, strip_path_prefix, Breakpoint, DebugEvent, Instrument, InstrumentGroup,
    Property, PropertyFlags, SourceLocation, StackFrame,
};

/// WebSocket subprotocol requested by the socket transport
pub const SUBPROTOCOL: &str = "x-xsbug";

/// Root element of every textual message
pub const ROOT_ELEMENT: &str = "xsbug";

/// Line terminator framing every textual command
pub const CRLF: &[u8] = b"\r\n";

/// Maximum number of consecutive open attempts before giving up
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Delay between open attempts in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Upper bound for a single open attempt in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Time a binary request waits for its reply in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Size of the first install chunk, used to confirm the device is ready
pub const INSTALL_PROBE_SIZE: usize = 16;

/// Size of every install chunk after the probe
pub const INSTALL_CHUNK_SIZE: usize = 512;

/// Largest binary message the USB framing can carry (u16 length prefix)
pub const MAX_BINARY_MESSAGE: usize = u16::MAX as usize;

/// Largest install chunk that fits a binary message: opcode, id and offset
/// take seven bytes
pub const MAX_INSTALL_CHUNK: usize = MAX_BINARY_MESSAGE - 7;
