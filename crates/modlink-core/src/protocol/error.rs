//! Protocol errors

use thiserror::Error;

use super::commands::Opcode;

/// Errors that can occur during device communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Connection is closed; reset it before connecting again")]
    Inert,

    #[error("Connection closed before the reply arrived")]
    Disconnected,

    #[error("Debugger message could not be read ({0}). Try reconnecting to the device.")]
    Parse(String),

    #[error("Install failed at offset {offset}: device returned code {code}")]
    Install { offset: u32, code: i16 },

    #[error("Device rejected {opcode:?} with code {code}")]
    Rejected { opcode: Opcode, code: i16 },

    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    #[error("No reply to request {id}")]
    RequestTimeout { id: u16 },

    #[error("Message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("All request ids are in use")]
    RequestsExhausted,

    #[error("Invalid reply frame")]
    InvalidReply,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error belongs to the transport layer and is worth retrying
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::Usb(_)
                | ProtocolError::WebSocket(_)
                | ProtocolError::Io(_)
        )
    }
}

impl From<quick_xml::Error> for ProtocolError {
    fn from(err: quick_xml::Error) -> Self {
        ProtocolError::Parse(err.to_string())
    }
}

impl From<nusb::transfer::TransferError> for ProtocolError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        ProtocolError::Usb(err.to_string())
    }
}
