//! # ModLink Core Library
//!
//! Device link for embedded XS runtimes.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Connection management over WebSocket or USB, with retry and recovery
//! - USB byte-stream reassembly into protocol frames
//! - xsbug debugger message parsing and command encoding
//! - Binary control requests with reply correlation
//! - Chunked firmware install
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use modlink_core::prelude::*;
//!
//! let connector = Arc::new(WebSocketConnector::new(SocketTarget::new("ws://device:8080")));
//! let (mut link, mut events) = ConnectionManager::new(connector, ConnectionConfig::default());
//! link.connect()?.wait().await?;
//!
//! link.set_breakpoint("/mc/main.js", 12)?;
//! while let Some(event) = events.recv().await {
//!     if let ConnectionEvent::Debug(DebugEvent::Break { path, line, .. }) = event {
//!         println!("stopped at {path}:{line}");
//!         link.go()?;
//!     }
//! }
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        ConnectionConfig, InstallConfig, LinkConfig, SocketTarget, Target, UsbTarget,
    };
    pub use crate::protocol::{
        Breakpoint, ConnectionEvent, ConnectionManager, ConnectionState, DebugCommand,
        DebugEvent, EventHandler, EventStream, ProtocolError, ReadySignal,
    };
    pub use crate::transport::{Connector, MemoryConnector, UsbConnector, WebSocketConnector};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
