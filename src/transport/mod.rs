//! Transport layer for the dongle link.
//!
//! A transport is a raw duplex byte channel. Framing happens above it, in
//! [`Link`](crate::link::Link).

pub mod serial;
pub mod stream;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Read half handed to the link's I/O task.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Human-readable name of the underlying channel, e.g. the port path.
    fn name(&self) -> String;

    /// Opens the channel.
    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the channel.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Writes raw bytes.
    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns true if open.
    fn is_open(&self) -> bool;

    /// Takes the read half for the I/O task.
    ///
    /// Returns `None` if the transport is closed or the reader was already
    /// taken.
    fn take_reader(&mut self) -> Option<BoxedReader>;
}

pub use serial::{SerialConfig, SerialTransport};
pub use stream::StreamTransport;
