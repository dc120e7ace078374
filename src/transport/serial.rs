//! Serial/USB transport implementation.
//!
//! This module provides serial port communication for dongles attached
//! through a USB-UART bridge.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};

use crate::error::{Error, Result};
use crate::transport::{BoxedReader, Transport};

/// Default baud rate for dongles.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// USB vendor/product pairs of known dongles.
pub const DONGL_USB_IDS: [(u16, u16); 2] = [
    // FTDI FT232R bridge on legacy dongles
    (0x0403, 0x6001),
    // Native USB firmware
    (0x9999, 0x0001),
];

/// How long to discard stale bytes after opening the port.
const DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }
}

/// Serial transport for dongle communication.
///
/// Uses split read/write halves so the I/O task can read while callers write.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<Arc<Mutex<WriteHalf<SerialStream>>>>,
    reader: Option<ReadHalf<SerialStream>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.config.port.clone()
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            tracing::info!("opening serial port: {}", self.config.port);

            let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .open_native_async()
                .map_err(Error::Serial)?;

            // The bridge can hold bytes from a previous session.
            let mut buf = [0u8; 256];
            let mut drained = 0usize;
            while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_WINDOW, stream.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
                drained += n;
            }
            if drained > 0 {
                tracing::debug!("drained {} stale bytes from buffer", drained);
            }

            let (reader, writer) = tokio::io::split(stream);
            self.reader = Some(reader);
            self.writer = Some(Arc::new(Mutex::new(writer)));

            tracing::info!("serial port open");
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() || self.reader.is_some() {
                tracing::info!("closing serial port: {}", self.config.port);
                self.writer = None;
                self.reader = None;
            }
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::ChannelClosed)?;
            let mut writer = writer.lock().await;

            tracing::trace!("writing {} bytes: {}", data.len(), hex::encode(&data));
            writer.write_all(&data).await?;
            writer.flush().await?;

            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn take_reader(&mut self) -> Option<BoxedReader> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as BoxedReader)
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Lists serial ports that belong to a dongle.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_dongl_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports
        .into_iter()
        .filter(is_dongl_port)
        .map(|p| p.port_name)
        .collect())
}

/// Returns true if the port is a USB device with a known dongle VID/PID.
#[must_use]
pub fn is_dongl_port(port: &SerialPortInfo) -> bool {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => DONGL_USB_IDS.contains(&(usb.vid, usb.pid)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use tokio_serial::UsbPortInfo;

    use super::*;

    fn usb_port(vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: "/dev/ttyUSB0".into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0").baud_rate(9600);
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn test_dongl_port_filter() {
        assert!(is_dongl_port(&usb_port(0x0403, 0x6001)));
        assert!(is_dongl_port(&usb_port(0x9999, 0x0001)));
        assert!(!is_dongl_port(&usb_port(0x0403, 0x6015)));
        assert!(!is_dongl_port(&SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::Unknown,
        }));
    }

    #[test]
    fn test_transport_starts_closed() {
        let mut transport = SerialTransport::with_port("/dev/ttyUSB0");
        assert!(!transport.is_open());
        assert!(transport.take_reader().is_none());
        assert_eq!(transport.name(), "/dev/ttyUSB0");
    }

    #[test]
    #[ignore = "Requires /sys/class/tty - not available in sandboxed builds"]
    fn test_list_ports() {
        let _ = list_ports();
    }
}
