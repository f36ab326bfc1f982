//! Device transports
//!
//! A [`Connector`] knows how to reach one device and opens a fresh
//! [`Transport`] per attempt. Transports move whole [`WireMessage`]s; any
//! byte-stream framing happens inside the transport.

mod memory;
mod socket;
mod usb;

pub use memory::{MemoryConnector, MemoryDevice, OpenOutcome};
pub use socket::{WebSocketConnector, WebSocketTransport};
pub use usb::{UsbConnector, UsbTransport};

use async_trait::async_trait;

use crate::config::Target;
use crate::protocol::{ProtocolError, WireMessage};

/// An open link to a device
#[async_trait]
pub trait Transport: Send {
    /// Send one message
    async fn send(&mut self, message: WireMessage) -> Result<(), ProtocolError>;

    /// Next inbound message; `Ok(None)` once the device closed the link
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no
    /// data.
    async fn recv(&mut self) -> Result<Option<WireMessage>, ProtocolError>;

    /// Release the link
    async fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Opens transports to one destination
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>, ProtocolError>;

    /// Human-readable destination, for logs
    fn describe(&self) -> String;
}

/// Build the connector for a configured target
pub fn connector_for(target: &Target) -> Box<dyn Connector> {
    match target {
        Target::Socket(socket) => Box::new(WebSocketConnector::new(socket.clone())),
        Target::Usb(usb) => Box::new(UsbConnector::new(usb.clone())),
    }
}
