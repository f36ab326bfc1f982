//! Link configuration
//!
//! Every setting has a default that matches what devices expect out of the
//! box, so a config file only needs to name the target.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_DELAY_MS,
    INSTALL_CHUNK_SIZE, INSTALL_PROBE_SIZE, MAX_CONNECT_ATTEMPTS, MAX_INSTALL_CHUNK,
};

/// Errors loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Connection retry and timeout settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay between failed open attempts
    pub retry_delay_ms: u64,
    /// Open attempts before giving up
    pub max_connect_attempts: u32,
    /// Upper bound on a single open attempt
    pub connect_timeout_ms: u64,
    /// How long a binary request waits for its reply
    pub request_timeout_ms: u64,
    /// Start a fresh attempt sequence when an established link drops
    pub reconnect_on_loss: bool,
}

impl ConnectionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject values that would stall the manager
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connect_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout_ms".into(),
                message: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reconnect_on_loss: true,
        }
    }
}

/// Firmware upload chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Size of the first chunk
    pub probe_size: usize,
    /// Size of every later chunk
    pub chunk_size: usize,
}

impl InstallConfig {
    /// Both chunk sizes must be non-zero and fit one binary message
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, size) in [("probe_size", self.probe_size), ("chunk_size", self.chunk_size)] {
            if size == 0 || size > MAX_INSTALL_CHUNK {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: format!("must be between 1 and {MAX_INSTALL_CHUNK}"),
                });
            }
        }
        Ok(())
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            probe_size: INSTALL_PROBE_SIZE,
            chunk_size: INSTALL_CHUNK_SIZE,
        }
    }
}

/// A device reachable over WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketTarget {
    /// e.g. `ws://192.168.1.20:8080`
    pub url: String,
}

impl SocketTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// A device behind a USB-to-UART bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbTarget {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub baud_rate: u32,
    /// Bytes requested per bulk read
    pub read_size: usize,
    /// Bulk reads kept in flight
    pub outstanding_reads: usize,
}

impl Default for UsbTarget {
    fn default() -> Self {
        // CP2102
        Self {
            vendor_id: 0x10C4,
            product_id: 0xEA60,
            interface: 0,
            bulk_in: 0x81,
            bulk_out: 0x01,
            baud_rate: 921_600,
            read_size: 512,
            outstanding_reads: 3,
        }
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Socket(SocketTarget),
    Usb(UsbTarget),
}

/// Complete link configuration, as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub target: Target,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub install: InstallConfig,
}

impl LinkConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.connection.validate()?;
        config.install.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
