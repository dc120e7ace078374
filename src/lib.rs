//! # dongl
//!
//! A Rust driver for the Dongl serial BLE dongle.
//!
//! The dongle runs the Bluetooth Low Energy stack itself and is driven over a
//! USB serial port with framed, CRC-checked commands. This library turns that
//! command set back into a central-role adapter: scanning, connecting,
//! attribute discovery and characteristic access.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Framed serial link with one outstanding command at a time
//! - Per-peripheral connection state machine with bounded retries
//! - Backend-neutral [`api::Adapter`] and [`api::Peripheral`] traits
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dongl::api::{Adapter, Backend, Peripheral};
//! use dongl::{DonglBackend, DonglConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dongl::Error> {
//!     let backend = DonglBackend::new(DonglConfig::default());
//!
//!     for adapter in backend.get_adapters().await? {
//!         adapter.scan_for(Duration::from_secs(5)).await?;
//!
//!         for peripheral in adapter.scan_get_results() {
//!             println!(
//!                 "{} {} {} dBm",
//!                 peripheral.address(),
//!                 peripheral.identifier(),
//!                 peripheral.rssi()
//!             );
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Wire framing, CRCs and the command/message codecs
//! - [`transport`] - Byte channels (USB serial, in-memory streams)
//! - [`link`] - Framed link with request/response correlation
//! - [`commands`] - Typed dongle commands
//! - [`api`] - Backend-neutral adapter and peripheral traits
//! - [`dongl`] - The dongle backend: adapter, peripheral, attribute table
//! - [`types`] - Addresses, UUIDs and GATT snapshots

pub mod api;
pub mod callback;
pub mod commands;
pub mod dongl;
pub mod error;
pub mod link;
pub mod protocol;
pub mod signal;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use commands::CommandHandler;
pub use dongl::{
    ConnectionState, DonglAdapter, DonglBackend, DonglConfig, DonglPeripheral, get_adapters,
};
pub use error::{DecodeError, Error, FrameError, Result};
pub use link::Link;
pub use transport::{SerialConfig, SerialTransport, StreamTransport, serial::list_ports};
pub use types::{AddressType, BluetoothAddress, ByteArray, Service};
