//! WebSocket transport
//!
//! The device runs a WebSocket server speaking the `x-xsbug` subprotocol.
//! Text frames carry xsbug markup, binary frames carry control packets.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Connector, Transport};
use crate::config::SocketTarget;
use crate::protocol::{ProtocolError, WireMessage, SUBPROTOCOL};

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Opens WebSocket links to one URL
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    target: SocketTarget,
}

impl WebSocketConnector {
    pub fn new(target: SocketTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn Transport>, ProtocolError> {
        let mut request = self.target.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(PROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));

        let (stream, response) = connect_async(request).await?;
        debug!(
            url = %self.target.url,
            status = %response.status(),
            "websocket opened"
        );
        Ok(Box::new(WebSocketTransport { stream }))
    }

    fn describe(&self) -> String {
        self.target.url.clone()
    }
}

/// An open WebSocket link
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WireMessage::Text(text))),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(WireMessage::Binary(bytes))),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by device");
                    return Ok(None);
                }
                // pings are answered by tungstenite
                Some(Ok(other)) => trace!(?other, "ignoring control frame"),
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
