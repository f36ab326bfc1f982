//! Connection events
//!
//! Everything the connection driver observes is delivered as a
//! [`ConnectionEvent`] on one ordered stream. Callers either match on the
//! enum directly or implement [`EventHandler`] and call
//! [`ConnectionEvent::dispatch`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use super::types::{DebugEvent, Instrument, Property, StackFrame};

/// An event from the connection, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A decoded debugger event
    Debug(DebugEvent),
    /// A textual message could not be parsed; the link stays up
    ProtocolError(String),
    /// The connection could not be established
    ConnectionError(String),
    /// An established link dropped and will not be reopened
    Disconnected,
    /// A binary message that is not a reply
    UnhandledBinary(Vec<u8>),
}

impl ConnectionEvent {
    /// Route the event to the matching handler method
    pub fn dispatch<H: EventHandler + ?Sized>(&self, handler: &mut H) {
        match self {
            ConnectionEvent::Debug(event) => match event {
                DebugEvent::Login { name, value } => handler.on_login(name, value),
                DebugEvent::Frames { frames } => handler.on_frames(frames),
                DebugEvent::Local { frame, properties } => handler.on_local(frame, properties),
                DebugEvent::Global { properties } => handler.on_global(properties),
                DebugEvent::Module { properties } => handler.on_module(properties),
                DebugEvent::Break {
                    path,
                    line,
                    message,
                } => handler.on_break(path, *line, message),
                DebugEvent::Log { text } => handler.on_log(text),
                DebugEvent::InstrumentSample { samples } => handler.on_instrument_sample(samples),
                DebugEvent::Instrument { instruments } => handler.on_instruments(instruments),
                DebugEvent::Other { .. } => handler.on_other(self),
            },
            ConnectionEvent::ProtocolError(message) => handler.on_protocol_error(message),
            ConnectionEvent::ConnectionError(message) => handler.on_connection_error(message),
            ConnectionEvent::Disconnected => handler.on_disconnected(),
            ConnectionEvent::UnhandledBinary(_) => handler.on_other(self),
        }
    }
}

/// Typed callbacks for [`ConnectionEvent`]s
///
/// Every method has an empty default; implement only what you need.
#[allow(unused_variables)]
pub trait EventHandler {
    fn on_login(&mut self, name: &str, value: &str) {}
    fn on_frames(&mut self, frames: &[StackFrame]) {}
    fn on_local(&mut self, frame: &StackFrame, properties: &[Property]) {}
    fn on_global(&mut self, properties: &[Property]) {}
    fn on_module(&mut self, properties: &[Property]) {}
    fn on_break(&mut self, path: &str, line: u32, message: &str) {}
    fn on_log(&mut self, text: &str) {}
    fn on_instrument_sample(&mut self, samples: &[i64]) {}
    fn on_instruments(&mut self, instruments: &[Instrument]) {}
    fn on_protocol_error(&mut self, message: &str) {}
    fn on_connection_error(&mut self, message: &str) {}
    fn on_disconnected(&mut self) {}
    /// Unknown elements and unsolicited binary messages
    fn on_other(&mut self, event: &ConnectionEvent) {}
}

/// Receiving end of a connection's events
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the connection manager is dropped
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl EventHandler for Recorder {
        fn on_break(&mut self, path: &str, line: u32, message: &str) {
            self.calls.push(format!("break {path}:{line} {message}"));
        }

        fn on_log(&mut self, text: &str) {
            self.calls.push(format!("log {text}"));
        }

        fn on_disconnected(&mut self) {
            self.calls.push("disconnected".into());
        }

        fn on_other(&mut self, event: &ConnectionEvent) {
            self.calls.push(format!("other {event:?}"));
        }
    }

    #[test]
    fn test_dispatch_routes_by_variant() {
        let mut recorder = Recorder::default();
        let events = [
            ConnectionEvent::Debug(DebugEvent::Log { text: "hi".into() }),
            ConnectionEvent::Debug(DebugEvent::Break {
                path: "/mc/main.js".into(),
                line: 3,
                message: "stop".into(),
            }),
            ConnectionEvent::Debug(DebugEvent::Other {
                element: "future".into(),
            }),
            ConnectionEvent::Disconnected,
            // no override, default is a no-op
            ConnectionEvent::ProtocolError("bad".into()),
        ];
        for event in &events {
            event.dispatch(&mut recorder);
        }

        assert_eq!(recorder.calls.len(), 4);
        assert_eq!(recorder.calls[0], "log hi");
        assert_eq!(recorder.calls[1], "break /mc/main.js:3 stop");
        assert!(recorder.calls[2].starts_with("other"));
        assert_eq!(recorder.calls[3], "disconnected");
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        use futures_util::StreamExt;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = EventStream::new(rx);
        for i in 0..3 {
            tx.send(ConnectionEvent::Debug(DebugEvent::Log {
                text: i.to_string(),
            }))
            .unwrap();
        }
        drop(tx);

        let texts: Vec<_> = stream
            .by_ref()
            .map(|event| match event {
                ConnectionEvent::Debug(DebugEvent::Log { text }) => text,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
            .await;
        assert_eq!(texts, vec!["0", "1", "2"]);
    }
}
