//! Connection management
//!
//! [`ConnectionManager`] owns the link to one device. `connect()` spawns a
//! driver task that opens the transport (retrying up to the configured
//! limit), then moves messages in both directions: outbound commands from
//! the manager, inbound text parsed into events and inbound replies handed
//! to the waiting request.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    commands::{ControlCommand, DebugCommand, Opcode},
    correlator::RequestCorrelator,
    events::{ConnectionEvent, EventStream},
    installer::{FirmwareInstaller, InstallProgress, ReplyChannel},
    message::parse_message,
    packet::Reply,
    types::Breakpoint,
    ProtocolError, WireMessage, MAX_BINARY_MESSAGE,
};
use crate::config::{ConnectionConfig, InstallConfig, LinkConfig};
use crate::transport::{connector_for, Connector, Transport};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the transport, possibly retrying
    Connecting,
    /// Connected and ready
    Connected,
    /// Gave up after the last allowed attempt
    Error,
}

/// First outcome of a connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed { attempts: u32 },
    Cancelled,
}

/// Resolves once the first connection attempt sequence settles
///
/// Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<Readiness>,
}

impl ReadySignal {
    /// Wait until the link is up, or until connecting failed
    pub async fn wait(&self) -> Result<(), ProtocolError> {
        let mut rx = self.rx.clone();
        let outcome = *rx
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map_err(|_| ProtocolError::Disconnected)?;
        match outcome {
            Readiness::Ready => Ok(()),
            Readiness::Failed { attempts } => Err(ProtocolError::ConnectionFailed { attempts }),
            Readiness::Pending | Readiness::Cancelled => Err(ProtocolError::Disconnected),
        }
    }

    /// Whether the outcome is known yet
    pub fn is_settled(&self) -> bool {
        *self.rx.borrow() != Readiness::Pending
    }
}

type PendingRequests = Arc<Mutex<RequestCorrelator>>;

fn lock(pending: &PendingRequests) -> MutexGuard<'_, RequestCorrelator> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running driver task
struct Session {
    outbound: mpsc::UnboundedSender<WireMessage>,
    cancel: CancellationToken,
    ready: ReadySignal,
    driver: JoinHandle<()>,
}

/// Link to one device
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    installer: FirmwareInstaller,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pending: PendingRequests,
    session: Option<Session>,
    inert: bool,
}

impl ConnectionManager {
    /// Create a manager and the stream its events are delivered on
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> (Self, EventStream) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            connector,
            config,
            installer: FirmwareInstaller::default(),
            state: Arc::new(state),
            events,
            pending: Arc::new(Mutex::new(RequestCorrelator::new())),
            session: None,
            inert: false,
        };
        (manager, EventStream::new(rx))
    }

    /// Create a manager for a configured target
    pub fn from_config(config: &LinkConfig) -> (Self, EventStream) {
        let connector: Arc<dyn Connector> = Arc::from(connector_for(&config.target));
        let (manager, events) = Self::new(connector, config.connection.clone());
        (manager.with_install_config(config.install.clone()), events)
    }

    pub fn with_install_config(mut self, config: InstallConfig) -> Self {
        self.installer = FirmwareInstaller::new(config);
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Start connecting
    ///
    /// Calling again while connecting or connected returns the same signal.
    /// A manager that was disconnected or gave up must be [`reset`] first.
    ///
    /// [`reset`]: ConnectionManager::reset
    pub fn connect(&mut self) -> Result<ReadySignal, ProtocolError> {
        if let Some(session) = &self.session {
            return match self.state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    Ok(session.ready.clone())
                }
                _ => Err(ProtocolError::Inert),
            };
        }
        if self.inert {
            return Err(ProtocolError::Inert);
        }

        info!(target = %self.connector.describe(), "connecting");
        self.state.send_replace(ConnectionState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let cancel = CancellationToken::new();

        let driver = Driver {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            ready: ready_tx,
            events: self.events.clone(),
            outbound: outbound_rx,
            pending: Arc::clone(&self.pending),
            cancel: cancel.clone(),
        };
        let ready = ReadySignal { rx: ready_rx };
        self.session = Some(Session {
            outbound: outbound_tx,
            cancel,
            ready: ready.clone(),
            driver: tokio::spawn(driver.run()),
        });
        Ok(ready)
    }

    /// Close the link and stop retrying
    ///
    /// No events are delivered after this returns. Requests still waiting
    /// fail with [`ProtocolError::Disconnected`].
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        if let Err(err) = session.driver.await {
            warn!(%err, "connection driver ended abnormally");
        }
        lock(&self.pending).clear();
        self.state.send_replace(ConnectionState::Disconnected);
        self.inert = true;
        info!("disconnected");
    }

    /// Return to a fresh, connectable state
    pub async fn reset(&mut self) {
        self.disconnect().await;
        self.inert = false;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn link(&self) -> Result<&Session, ProtocolError> {
        let Some(session) = &self.session else {
            return Err(if self.inert {
                ProtocolError::Inert
            } else {
                ProtocolError::NotConnected
            });
        };
        if self.state() != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected);
        }
        Ok(session)
    }

    fn submit(&self, message: WireMessage) -> Result<(), ProtocolError> {
        check_size(&message)?;
        self.link()?
            .outbound
            .send(message)
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Send a debugger command
    pub fn send(&self, command: &DebugCommand) -> Result<(), ProtocolError> {
        debug!(command = %command.element(), "debug command");
        self.submit(WireMessage::Text(command.to_wire()))
    }

    pub fn go(&self) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::Go)
    }

    pub fn step(&self) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::Step)
    }

    pub fn step_inside(&self) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::StepInside)
    }

    pub fn step_outside(&self) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::StepOutside)
    }

    pub fn set_breakpoint(&self, path: &str, line: u32) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::SetBreakpoint(Breakpoint::new(path, line)))
    }

    pub fn clear_breakpoint(&self, path: &str, line: u32) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::ClearBreakpoint(Breakpoint::new(path, line)))
    }

    /// Replace all breakpoints, optionally breaking on exceptions and at start
    pub fn set_all_breakpoints(
        &self,
        breakpoints: Vec<Breakpoint>,
        exceptions: bool,
        start: bool,
    ) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::SetAllBreakpoints {
            breakpoints,
            exceptions,
            start,
        })
    }

    /// Select a stack frame
    pub fn select(&self, id: &str) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::Select(id.to_string()))
    }

    /// Expand or collapse a property
    pub fn toggle(&self, id: &str) -> Result<(), ProtocolError> {
        self.send(&DebugCommand::Toggle(id.to_string()))
    }

    /// Send a control command without waiting for a reply
    pub fn control(&self, command: &ControlCommand) -> Result<(), ProtocolError> {
        debug!(opcode = ?command.opcode(), "control command");
        self.submit(WireMessage::Binary(command.encode(None)))
    }

    pub fn restart(&self) -> Result<(), ProtocolError> {
        self.control(&ControlCommand::Restart)
    }

    /// Remove the installed mod
    pub async fn uninstall(&self) -> Result<(), ProtocolError> {
        let reply = self.request(ControlCommand::Uninstall).await?;
        if !reply.is_success() {
            return Err(ProtocolError::Rejected {
                opcode: Opcode::Uninstall,
                code: reply.code,
            });
        }
        Ok(())
    }

    pub fn set_preference(&self, domain: &str, key: &str, value: &str) -> Result<(), ProtocolError> {
        self.control(&ControlCommand::SetPreference {
            domain: domain.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Read a preference; `None` when the device has no value for it
    pub async fn get_preference(
        &self,
        domain: &str,
        key: &str,
    ) -> Result<Option<String>, ProtocolError> {
        let reply = self
            .request(ControlCommand::GetPreference {
                domain: domain.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(reply.is_success().then(|| reply.text()))
    }

    /// Send a control command and wait for its reply
    ///
    /// Fails with [`ProtocolError::RequestTimeout`] if no reply arrives within
    /// the configured request timeout. Commands the device never answers
    /// (e.g. restart) always time out.
    pub async fn request(&self, command: ControlCommand) -> Result<Reply, ProtocolError> {
        let session = self.link()?;
        let (tx, rx) = oneshot::channel();
        let id = lock(&self.pending)
            .register(tx)
            .ok_or(ProtocolError::RequestsExhausted)?;
        debug!(id, opcode = ?command.opcode(), "request");

        let message = WireMessage::Binary(command.encode(Some(id)));
        if let Err(err) = check_size(&message) {
            lock(&self.pending).cancel(id);
            return Err(err);
        }
        if session.outbound.send(message).is_err() {
            lock(&self.pending).cancel(id);
            return Err(ProtocolError::NotConnected);
        }

        match timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::Disconnected),
            Err(_) => {
                lock(&self.pending).cancel(id);
                warn!(id, "request timed out");
                Err(ProtocolError::RequestTimeout { id })
            }
        }
    }

    /// Upload a firmware image; see [`FirmwareInstaller::install`]
    pub async fn install<F>(&self, image: &[u8], progress: F) -> Result<i16, ProtocolError>
    where
        F: FnMut(InstallProgress) + Send,
    {
        self.link()?;
        self.installer.install(self, image, progress).await
    }
}

#[async_trait]
impl ReplyChannel for ConnectionManager {
    async fn request(&self, command: ControlCommand) -> Result<Reply, ProtocolError> {
        ConnectionManager::request(self, command).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// Binary messages must fit the USB length prefix
fn check_size(message: &WireMessage) -> Result<(), ProtocolError> {
    match message {
        WireMessage::Binary(bytes) if bytes.len() > MAX_BINARY_MESSAGE => {
            Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_BINARY_MESSAGE,
            })
        }
        _ => Ok(()),
    }
}

/// Why a served link ended
enum LinkEnd {
    Cancelled,
    Lost,
}

/// One iteration of the serve loop
enum Step {
    Cancel,
    Send(WireMessage),
    Receive(Result<Option<WireMessage>, ProtocolError>),
}

/// Task that owns the transport
struct Driver {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    ready: watch::Sender<Readiness>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<WireMessage>,
    pending: PendingRequests,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let Some(mut transport) = self.establish().await else {
                break;
            };
            let end = self.serve(transport.as_mut()).await;
            lock(&self.pending).clear();
            if let Err(err) = transport.close().await {
                debug!(%err, "error closing transport");
            }

            match end {
                LinkEnd::Cancelled => break,
                LinkEnd::Lost => {
                    if !self.config.reconnect_on_loss {
                        self.state.send_replace(ConnectionState::Disconnected);
                        self.emit(ConnectionEvent::Disconnected);
                        break;
                    }
                    // not surfaced as an event
                    info!("link lost, reconnecting");
                    self.state.send_replace(ConnectionState::Connecting);
                }
            }
        }
        self.settle(Readiness::Cancelled);
    }

    /// Open the transport, retrying up to the attempt limit
    ///
    /// `None` when cancelled or when every attempt failed.
    async fn establish(&mut self) -> Option<Box<dyn Transport>> {
        let max_attempts = self.config.max_connect_attempts.max(1);
        for attempt in 1..=max_attempts {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                opened = timeout(self.config.connect_timeout(), self.connector.open()) => opened,
            };

            match opened {
                Ok(Ok(transport)) => {
                    info!(attempt, "connected");
                    self.state.send_replace(ConnectionState::Connected);
                    self.settle(Readiness::Ready);
                    return Some(transport);
                }
                Ok(Err(err)) => warn!(attempt, max_attempts, %err, "connection attempt failed"),
                Err(_) => warn!(attempt, max_attempts, "connection attempt timed out"),
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    _ = sleep(self.config.retry_delay()) => {}
                }
            }
        }

        let err = ProtocolError::ConnectionFailed {
            attempts: max_attempts,
        };
        error!(%err, "giving up");
        self.state.send_replace(ConnectionState::Error);
        self.settle(Readiness::Failed {
            attempts: max_attempts,
        });
        self.emit(ConnectionEvent::ConnectionError(err.to_string()));
        None
    }

    async fn serve(&mut self, transport: &mut dyn Transport) -> LinkEnd {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancel,
                outbound = self.outbound.recv() => match outbound {
                    Some(message) => Step::Send(message),
                    None => Step::Cancel,
                },
                inbound = transport.recv() => Step::Receive(inbound),
            };

            match step {
                Step::Cancel => return LinkEnd::Cancelled,
                Step::Send(message) => match transport.send(message).await {
                    Ok(()) => {}
                    Err(err) if err.is_transport() => {
                        warn!(%err, "send failed");
                        return LinkEnd::Lost;
                    }
                    Err(err) => warn!(%err, "message dropped"),
                },
                Step::Receive(Ok(Some(message))) => self.handle(message),
                Step::Receive(Ok(None)) => {
                    info!("device closed the link");
                    return LinkEnd::Lost;
                }
                Step::Receive(Err(err)) => {
                    warn!(%err, "receive failed");
                    return LinkEnd::Lost;
                }
            }
        }
    }

    fn handle(&mut self, message: WireMessage) {
        match message {
            WireMessage::Text(text) => match parse_message(&text) {
                Ok(events) => {
                    for event in events {
                        self.emit(ConnectionEvent::Debug(event));
                    }
                }
                Err(err) => {
                    warn!(%err, "unreadable debugger message");
                    self.emit(ConnectionEvent::ProtocolError(err.to_string()));
                }
            },
            WireMessage::Binary(bytes) if bytes.first() == Some(&Opcode::Reply.byte()) => {
                match Reply::from_bytes(&bytes) {
                    Ok(reply) => {
                        debug!(id = reply.id, code = reply.code, "reply");
                        lock(&self.pending).resolve(reply);
                    }
                    Err(err) => {
                        warn!(%err, len = bytes.len(), "malformed reply");
                        self.emit(ConnectionEvent::ProtocolError(err.to_string()));
                    }
                }
            }
            WireMessage::Binary(bytes) => {
                debug!(len = bytes.len(), "unhandled binary message");
                self.emit(ConnectionEvent::UnhandledBinary(bytes));
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // receiver gone means nobody is listening
        let _ = self.events.send(event);
    }

    fn settle(&self, outcome: Readiness) {
        self.ready.send_if_modified(|current| {
            if *current == Readiness::Pending {
                *current = outcome;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlPacket, DebugEvent};
    use crate::transport::{MemoryConnector, MemoryDevice, OpenOutcome};
    use std::time::Duration;
    use tokio::time::Instant;

    fn manager_for(
        connector: &Arc<MemoryConnector>,
        config: ConnectionConfig,
    ) -> (ConnectionManager, EventStream) {
        let connector: Arc<dyn Connector> = connector.clone();
        ConnectionManager::new(connector, config)
    }

    /// Answers every request with code 0 and `data`
    fn answer_requests(mut device: MemoryDevice, data: &'static [u8]) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = device.recv().await {
                let WireMessage::Binary(bytes) = message else {
                    continue;
                };
                let packet = ControlPacket::from_bytes(&bytes).unwrap();
                if let Some(id) = packet.request_id {
                    let reply = Reply {
                        id,
                        code: 0,
                        data: data.to_vec(),
                    };
                    device.send_bytes(reply.to_bytes());
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_ten_attempts() {
        let (connector, _devices) = MemoryConnector::new();
        let connector = Arc::new(connector.refuse_first(10));
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());

        let started = Instant::now();
        let ready = manager.connect().unwrap();
        let err = ready.wait().await.unwrap_err();

        assert!(matches!(err, ProtocolError::ConnectionFailed { attempts: 10 }));
        assert_eq!(manager.state(), ConnectionState::Error);
        // nine delays between ten attempts
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectionError(_))
        ));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 10);
        assert!(matches!(manager.connect(), Err(ProtocolError::Inert)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_last_allowed_attempt() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector.refuse_first(9));
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());

        manager.connect().unwrap().wait().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 10);
        assert!(devices.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_open_is_bounded_by_timeout() {
        let (connector, _devices) = MemoryConnector::new();
        let connector = Arc::new(connector.script([OpenOutcome::Hang]));
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());

        let started = Instant::now();
        manager.connect().unwrap().wait().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_shares_signal() {
        let (connector, _devices) = MemoryConnector::new();
        let connector = Arc::new(connector.refuse_first(2));
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());

        let first = manager.connect().unwrap();
        let second = manager.connect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert!(manager.connect().unwrap().is_settled());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_commands_reach_device() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        manager.set_breakpoint("/mc/main.js", 7).unwrap();
        manager.go().unwrap();
        manager.restart().unwrap();

        assert_eq!(
            device.recv().await,
            Some(WireMessage::Text(
                "\r\n<set-breakpoint path=\"/mc/main.js\" line=\"7\"/>\r\n".into()
            ))
        );
        assert_eq!(
            device.recv().await,
            Some(WireMessage::Text("\r\n<go/>\r\n".into()))
        );
        assert_eq!(device.recv().await, Some(WireMessage::Binary(vec![1])));
    }

    #[tokio::test]
    async fn test_commands_rejected_before_connect() {
        let (connector, _devices) = MemoryConnector::new();
        let (manager, _events) = manager_for(&Arc::new(connector), ConnectionConfig::default());
        assert!(matches!(manager.go(), Err(ProtocolError::NotConnected)));
        assert!(matches!(
            manager.request(ControlCommand::Uninstall).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reply_correlates_to_request() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        answer_requests(devices.recv().await.unwrap(), b"debug\0");

        let value = manager.get_preference("config", "when").await.unwrap();
        assert_eq!(value.as_deref(), Some("debug"));
        manager.uninstall().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let _silent = devices.recv().await.unwrap();

        let started = Instant::now();
        let err = manager.request(ControlCommand::Uninstall).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RequestTimeout { id: 1 }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(lock(&manager.pending).is_empty());
    }

    #[tokio::test]
    async fn test_events_in_order_and_parse_error_keeps_link() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let device = devices.recv().await.unwrap();

        device.send_text(r#"<xsbug><login name="main" value="XS"/></xsbug>"#);
        device.send_text("<xsbug><log>unterminated");
        device.send_text("<xsbug><log>one</log><log>two</log></xsbug>");
        device.send_bytes(vec![9, 9]);

        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Debug(DebugEvent::Login {
                name: "main".into(),
                value: "XS".into()
            }))
        );
        let Some(ConnectionEvent::ProtocolError(message)) = events.recv().await else {
            panic!("expected a protocol error");
        };
        assert!(message.contains("reconnect"));
        for text in ["one", "two"] {
            assert_eq!(
                events.recv().await,
                Some(ConnectionEvent::Debug(DebugEvent::Log { text: text.into() }))
            );
        }
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::UnhandledBinary(vec![9, 9]))
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_final_until_reset() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(device.recv().await, None);
        device.send_text("<xsbug><log>late</log></xsbug>");
        assert!(events.try_recv().is_none());
        assert!(matches!(manager.go(), Err(ProtocolError::Inert)));
        assert!(matches!(manager.connect(), Err(ProtocolError::Inert)));

        manager.reset().await;
        manager.connect().unwrap().wait().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiting_request() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, _events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let device = devices.recv().await.unwrap();

        let (tx, rx) = oneshot::channel();
        lock(&manager.pending).register(tx);
        manager.disconnect().await;
        assert!(rx.await.is_err());
        drop(device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_loss() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());
        let mut states = manager.watch_state();
        manager.connect().unwrap().wait().await.unwrap();

        devices.recv().await.unwrap().hang_up();
        let mut second = devices.recv().await.unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(connector.attempts(), 2);
        // a recovered loss is not reported
        assert_eq!(events.try_recv(), None);

        manager.step().unwrap();
        assert_eq!(
            second.recv().await,
            Some(WireMessage::Text(DebugCommand::Step.to_wire()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_message_does_not_survive_reconnect() {
        let (connector, mut devices) = MemoryConnector::byte_stream();
        let connector = Arc::new(connector);
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());
        let mut states = manager.watch_state();
        manager.connect().unwrap().wait().await.unwrap();

        let first = devices.recv().await.unwrap();
        first.send_bytes(b"\r\n<?xs.00000001?>\r\n<xsbug><log>par".to_vec());
        first.hang_up();

        let second = devices.recv().await.unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        second.send_bytes(b"t</log></xsbug>\r\n".to_vec());
        second.send_bytes(b"\r\n<?xs.00000001?>\r\n<xsbug><log>fresh</log></xsbug>\r\n".to_vec());

        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Debug(DebugEvent::Log {
                text: "fresh".into()
            }))
        );
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected_and_link_stays_up() {
        let (connector, mut devices) = MemoryConnector::byte_stream();
        let connector = Arc::new(connector);
        let (mut manager, mut events) = manager_for(&connector, ConnectionConfig::default());
        manager.connect().unwrap().wait().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let value = "v".repeat(70_000);
        let err = manager.set_preference("config", "big", &value).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MessageTooLarge {
                limit: MAX_BINARY_MESSAGE,
                ..
            }
        ));

        let command = ControlCommand::SetPreference {
            domain: "config".into(),
            key: "big".into(),
            value,
        };
        assert!(matches!(
            manager.request(command).await,
            Err(ProtocolError::MessageTooLarge { .. })
        ));
        assert!(lock(&manager.pending).is_empty());

        manager.go().unwrap();
        let Some(WireMessage::Binary(raw)) = device.recv().await else {
            panic!("expected raw bytes");
        };
        assert!(raw.ends_with(b"<go/>\r\n"));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_loss_without_reconnect_goes_inert() {
        let (connector, mut devices) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let config = ConnectionConfig {
            reconnect_on_loss: false,
            ..ConnectionConfig::default()
        };
        let (mut manager, mut events) = manager_for(&connector, config);
        manager.connect().unwrap().wait().await.unwrap();

        devices.recv().await.unwrap().hang_up();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        let mut states = manager.watch_state();
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(matches!(manager.connect(), Err(ProtocolError::Inert)));
        assert_eq!(connector.attempts(), 1);
    }
}
