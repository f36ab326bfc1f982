//! In-process transport
//!
//! Pairs a host-side [`Transport`] with a [`MemoryDevice`] handle so tests
//! and simulators can play the device. Opens can be scripted to fail or
//! hang, which drives the connection manager's retry logic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use super::{Connector, Transport};
use crate::protocol::{ProtocolError, UsbFrameCodec, WireMessage};

/// What the next `open()` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    /// Fail immediately, like a refused connection
    Refuse,
    /// Never complete; the caller's timeout has to fire
    Hang,
}

/// Connector handing out in-memory links
///
/// Every accepted open delivers the device end of the new link on the
/// receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    script: Mutex<VecDeque<OpenOutcome>>,
    attempts: AtomicU32,
    byte_stream: bool,
    devices: mpsc::UnboundedSender<MemoryDevice>,
}

impl MemoryConnector {
    /// Message-oriented links, like a WebSocket
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryDevice>) {
        let (devices, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Mutex::new(VecDeque::new()),
                attempts: AtomicU32::new(0),
                byte_stream: false,
                devices,
            },
            rx,
        )
    }

    /// Byte-stream links framed like USB
    ///
    /// Each message the device sends is treated as a raw chunk of bytes and
    /// run through [`UsbFrameCodec`]; outbound messages arrive at the device
    /// as raw encoded bytes.
    pub fn byte_stream() -> (Self, mpsc::UnboundedReceiver<MemoryDevice>) {
        let (mut connector, rx) = Self::new();
        connector.byte_stream = true;
        (connector, rx)
    }

    /// Queue outcomes for the next opens; later opens accept
    pub fn script(self, outcomes: impl IntoIterator<Item = OpenOutcome>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    /// Refuse the next `count` opens
    pub fn refuse_first(self, count: usize) -> Self {
        self.script(std::iter::repeat(OpenOutcome::Refuse).take(count))
    }

    /// Number of `open()` calls so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> OpenOutcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(OpenOutcome::Accept)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Box<dyn Transport>, ProtocolError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.next_outcome() {
            OpenOutcome::Refuse => {
                return Err(ProtocolError::Transport(format!(
                    "connection refused (attempt {attempt})"
                )))
            }
            OpenOutcome::Hang => std::future::pending::<()>().await,
            OpenOutcome::Accept => {}
        }

        let (to_device, from_host) = mpsc::unbounded_channel();
        let (to_host, from_device) = mpsc::unbounded_channel();
        self.devices
            .send(MemoryDevice {
                incoming: from_host,
                outgoing: to_host,
            })
            .map_err(|_| ProtocolError::Transport("device side is gone".into()))?;

        Ok(Box::new(MemoryTransport {
            tx: Some(to_device),
            rx: from_device,
            codec: self.byte_stream.then(UsbFrameCodec::new),
            buffer: BytesMut::new(),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Host end of an in-memory link
struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    codec: Option<UsbFrameCodec>,
    buffer: BytesMut,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        let tx = self.tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        let message = match self.codec.as_mut() {
            Some(codec) => {
                let mut encoded = BytesMut::new();
                codec.encode(message, &mut encoded)?;
                WireMessage::Binary(encoded.to_vec())
            }
            None => message,
        };
        tx.send(message)
            .map_err(|_| ProtocolError::Transport("device closed the link".into()))
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        loop {
            if let Some(codec) = self.codec.as_mut() {
                if let Some(frame) = codec.decode(&mut self.buffer)? {
                    return Ok(Some(frame.into_message()));
                }
            }
            let Some(message) = self.rx.recv().await else {
                return Ok(None);
            };
            if self.codec.is_none() {
                return Ok(Some(message));
            }
            match message {
                WireMessage::Text(text) => self.buffer.extend_from_slice(text.as_bytes()),
                WireMessage::Binary(bytes) => self.buffer.extend_from_slice(&bytes),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// Device end of an in-memory link
pub struct MemoryDevice {
    incoming: mpsc::UnboundedReceiver<WireMessage>,
    outgoing: mpsc::UnboundedSender<WireMessage>,
}

impl MemoryDevice {
    /// Next message from the host; `None` once the host closed the link
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.incoming.try_recv().ok()
    }

    /// Send a message to the host; false if the host is gone
    pub fn send(&self, message: WireMessage) -> bool {
        self.outgoing.send(message).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireMessage::Text(text.into()))
    }

    /// Send binary data (raw bytes on a byte-stream link)
    pub fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.send(WireMessage::Binary(bytes.into()))
    }

    /// Drop the link from the device side
    pub fn hang_up(self) {}
}
