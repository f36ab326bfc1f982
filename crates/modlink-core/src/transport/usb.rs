//! USB transport
//!
//! Talks to a CP210x-style USB-to-UART bridge through its bulk endpoints.
//! The bridge is configured with vendor control requests; after that the
//! UART stream is read with several bulk-in transfers kept in flight and
//! reassembled by [`UsbFrameCodec`].

use async_trait::async_trait;
use bytes::BytesMut;
use nusb::transfer::{ControlOut, ControlType, Queue, Recipient, RequestBuffer};
use nusb::Interface;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, trace};

use super::{Connector, Transport};
use crate::config::UsbTarget;
use crate::protocol::{ProtocolError, UsbFrameCodec, WireMessage};

/// Bridge reference clock; the baud divisor is taken against it
const BAUD_CLOCK: u32 = 3_686_400;

// vendor requests
const IFC_ENABLE: u8 = 0x00;
const SET_BAUDDIV: u8 = 0x01;
const SET_MHS: u8 = 0x07;
const PURGE: u8 = 0x12;

/// DTR and RTS both driven low; keeps ESP32-style boards out of reset
const MHS_DTR_RTS_LOW: u16 = 0x0300;
/// Clear transmit and receive queues
const PURGE_ALL: u16 = 0x000F;

/// Opens the first matching USB device
#[derive(Debug, Clone)]
pub struct UsbConnector {
    target: UsbTarget,
}

impl UsbConnector {
    pub fn new(target: UsbTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Connector for UsbConnector {
    async fn open(&self) -> Result<Box<dyn Transport>, ProtocolError> {
        let target = self.target.clone();
        let interface = tokio::task::spawn_blocking(move || claim(&target))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))??;

        configure(&interface, &self.target).await?;

        let mut reads = interface.bulk_in_queue(self.target.bulk_in);
        for _ in 0..self.target.outstanding_reads.max(1) {
            reads.submit(RequestBuffer::new(self.target.read_size));
        }

        info!(device = %self.describe(), "usb device opened");
        Ok(Box::new(UsbTransport {
            interface,
            reads,
            bulk_out: self.target.bulk_out,
            read_size: self.target.read_size,
            codec: UsbFrameCodec::new(),
            buffer: BytesMut::new(),
        }))
    }

    fn describe(&self) -> String {
        format!(
            "usb {:04x}:{:04x}",
            self.target.vendor_id, self.target.product_id
        )
    }
}

fn claim(target: &UsbTarget) -> Result<Interface, ProtocolError> {
    let info = nusb::list_devices()?
        .find(|d| d.vendor_id() == target.vendor_id && d.product_id() == target.product_id)
        .ok_or_else(|| {
            ProtocolError::Usb(format!(
                "no device {:04x}:{:04x}",
                target.vendor_id, target.product_id
            ))
        })?;
    let device = info.open()?;
    Ok(device.claim_interface(target.interface)?)
}

/// Vendor request sequence that brings the UART up
async fn configure(interface: &Interface, target: &UsbTarget) -> Result<(), ProtocolError> {
    if target.baud_rate == 0 {
        return Err(ProtocolError::Usb("baud rate must be non-zero".into()));
    }
    let divisor = u16::try_from(BAUD_CLOCK / target.baud_rate)
        .map_err(|_| ProtocolError::Usb(format!("baud rate {} too low", target.baud_rate)))?;

    let index = u16::from(target.interface);
    let steps = [
        (IFC_ENABLE, 0),
        (IFC_ENABLE, 1),
        (SET_MHS, MHS_DTR_RTS_LOW),
        (SET_BAUDDIV, divisor),
        (PURGE, PURGE_ALL),
    ];
    for (request, value) in steps {
        trace!(request, value, "usb control out");
        interface
            .control_out(ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Interface,
                request,
                value,
                index,
                data: &[],
            })
            .await
            .into_result()?;
    }
    debug!(baud = target.baud_rate, divisor, "uart configured");
    Ok(())
}

/// An open USB link
pub struct UsbTransport {
    interface: Interface,
    reads: Queue<RequestBuffer>,
    bulk_out: u8,
    read_size: usize,
    codec: UsbFrameCodec,
    buffer: BytesMut,
}

#[async_trait]
impl Transport for UsbTransport {
    async fn send(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        let mut encoded = BytesMut::new();
        self.codec.encode(message, &mut encoded)?;
        self.interface
            .bulk_out(self.bulk_out, encoded.to_vec())
            .await
            .into_result()?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame.into_message()));
            }

            // completions arrive in submission order
            let completion = self.reads.next_complete().await;
            completion.status?;
            trace!(bytes = completion.data.len(), "usb read");
            self.buffer.extend_from_slice(&completion.data);
            self.reads
                .submit(RequestBuffer::reuse(completion.data, self.read_size));
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.reads.cancel_all();
        while self.reads.pending() > 0 {
            let _ = self.reads.next_complete().await;
        }
        Ok(())
    }
}
