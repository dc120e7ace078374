//! Backend for the serial BLE dongle.
//!
//! The dongle runs the BLE link layer itself; this backend drives it through
//! [`Link`](crate::link::Link) and rebuilds connection and attribute state
//! from the events it reports.

pub mod adapter;
pub mod attributes;
pub mod peripheral;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{AdapterRef, Backend};
use crate::error::Result;
use crate::link::DEFAULT_EXCHANGE_TIMEOUT;
use crate::transport::{SerialTransport, serial::list_dongl_ports};

pub use adapter::DonglAdapter;
pub use attributes::AttributeTree;
pub use peripheral::DonglPeripheral;

/// Connection handle meaning "not connected".
pub const CONN_HANDLE_INVALID: u16 = 0xFFFF;

/// Connection handle marking a connect attempt in flight.
pub const CONN_HANDLE_PENDING: u16 = 0xFFFE;

/// Default time to wait for a connection event.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default time to wait for a disconnection event.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default time to wait for attribute discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(15000);

/// Default pause between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(750);

/// Default number of connect attempts.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Timing and retry policy for the dongle backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DonglConfig {
    /// Time to wait for a command response.
    pub exchange_timeout: Duration,
    /// Time to wait for a connection event.
    pub connect_timeout: Duration,
    /// Time to wait for a disconnection event.
    pub disconnect_timeout: Duration,
    /// Time to wait for attribute discovery to finish.
    pub discovery_timeout: Duration,
    /// Pause between connect attempts.
    pub retry_delay: Duration,
    /// Connect attempts before giving up.
    pub max_connect_attempts: u32,
}

impl DonglConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        }
    }

    /// Sets the command response timeout.
    #[must_use]
    pub const fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Sets the connection event timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the disconnection event timeout.
    #[must_use]
    pub const fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets the attribute discovery timeout.
    #[must_use]
    pub const fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the pause between connect attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the number of connect attempts.
    #[must_use]
    pub const fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }
}

impl Default for DonglConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection lifecycle of a peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Connect command sent, waiting for the connection event.
    Connecting,
    /// Connection event received.
    Connected,
    /// Waiting for attribute discovery to finish.
    Discovering,
    /// Connected with attributes available.
    Ready,
    /// The last connect attempt timed out.
    Failed,
}

/// Connection handle and lifecycle, shared with waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Current connection handle.
    pub conn_handle: u16,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Set when the final attribute batch has arrived.
    pub discovered: bool,
}

impl Session {
    /// Returns true if the handle refers to a live connection.
    #[must_use]
    pub const fn has_valid_handle(&self) -> bool {
        self.conn_handle != CONN_HANDLE_INVALID && self.conn_handle != CONN_HANDLE_PENDING
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            conn_handle: CONN_HANDLE_INVALID,
            state: ConnectionState::Disconnected,
            discovered: false,
        }
    }
}

/// Opens dongles attached over USB serial.
#[derive(Debug, Clone, Copy, Default)]
pub struct DonglBackend {
    config: DonglConfig,
}

impl DonglBackend {
    /// Creates a backend using `config` for every adapter it opens.
    #[must_use]
    pub const fn new(config: DonglConfig) -> Self {
        Self { config }
    }
}

impl Backend for DonglBackend {
    fn name(&self) -> &'static str {
        "Dongl"
    }

    fn bluetooth_enabled(&self) -> bool {
        true
    }

    fn get_adapters(&self) -> BoxFuture<'_, Result<Vec<AdapterRef>>> {
        Box::pin(async move {
            let mut adapters: Vec<AdapterRef> = Vec::new();
            for port in list_dongl_ports()? {
                let transport = SerialTransport::with_port(&port);
                match DonglAdapter::open(Box::new(transport), self.config).await {
                    Ok(adapter) => adapters.push(adapter),
                    Err(e) => tracing::warn!("skipping dongle on {}: {}", port, e),
                }
            }
            tracing::debug!("found {} dongle adapters", adapters.len());
            Ok(adapters)
        })
    }
}

/// Enumerates attached dongles with the default configuration.
///
/// # Errors
///
/// Returns an error if serial ports cannot be listed.
pub async fn get_adapters() -> Result<Vec<AdapterRef>> {
    DonglBackend::default().get_adapters().await
}
