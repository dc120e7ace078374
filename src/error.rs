//! Error types for the dongl library.

use thiserror::Error;
use uuid::Uuid;

/// The main error type for dongl operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A frame was received intact but its content could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Operation timed out waiting for the dongle.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Another exchange is already waiting for its response.
    #[error("another command is already pending")]
    ExchangeBusy,

    /// The dongle answered with a response of the wrong kind.
    #[error("unexpected response to {command}: {got}")]
    UnexpectedResponse { command: &'static str, got: String },

    /// The dongle rejected a command.
    #[error("{command} failed with return code {ret_code}")]
    CommandFailed { command: &'static str, ret_code: u32 },

    /// A peripheral or adapter operation could not be completed.
    #[error("operation failed: {reason}")]
    OperationFailed { reason: String },

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// Service lookup failed.
    #[error("service {service} not found")]
    ServiceNotFound { service: Uuid },

    /// Characteristic lookup failed.
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// Descriptor lookup failed.
    #[error("descriptor {descriptor} not found in characteristic {characteristic} of service {service}")]
    DescriptorNotFound {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },

    /// The operation is not available over the dongle link.
    #[error("{operation} is not yet supported over this transport")]
    NotSupported { operation: &'static str },

    /// Invalid Bluetooth address format.
    #[error("invalid bluetooth address: {address}")]
    InvalidAddress { address: String },

    /// The I/O task has stopped.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    pub(crate) fn operation_failed(reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            reason: reason.into(),
        }
    }
}

/// Wire framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Length field exceeds the maximum payload size.
    #[error("invalid length: {length} bytes exceeds maximum {max}")]
    InvalidLength { length: usize, max: usize },

    /// Frame CRC did not match the payload.
    #[error(
        "crc failure: received 0x{received:04x}, computed 0x{computed:04x} (payload: {})",
        hex::encode(.payload)
    )]
    CrcFailure {
        received: u16,
        computed: u16,
        /// The rejected payload, as received.
        payload: Vec<u8>,
    },

    /// Outgoing payload exceeds the maximum payload size.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Message decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Empty message.
    #[error("empty message")]
    Empty,

    /// Unknown discriminant tag.
    #[error("unknown message tag 0x{tag:02x}")]
    UnknownTag { tag: u8 },

    /// Unknown opcode for the given message kind.
    #[error("unknown {kind} opcode 0x{opcode:02x}")]
    UnknownOpcode { kind: &'static str, opcode: u8 },

    /// Message ended before a field could be read.
    #[error("truncated {what}: need {needed} bytes, got {got} (raw: {})", hex::encode(.raw))]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
        raw: Vec<u8>,
    },

    /// A field held a value outside its domain.
    #[error("invalid {what} value 0x{value:02x}")]
    InvalidValue { what: &'static str, value: u8 },

    /// UART frame does not start with the start byte.
    #[error("bad start byte 0x{:02x} (raw: {})", .raw.first().copied().unwrap_or(0), hex::encode(.raw))]
    StartByte { raw: Vec<u8> },

    /// UART frame CRC mismatch.
    #[error("crc mismatch: received 0x{received:04x}, computed 0x{computed:04x} (raw: {})", hex::encode(.raw))]
    Crc {
        raw: Vec<u8>,
        received: u16,
        computed: u16,
    },

    /// UART payload length does not fit the op code.
    #[error("invalid payload for op code 0x{op_code:02x}: {} bytes", .payload.len())]
    PayloadLength { op_code: u8, payload: Vec<u8> },
}

/// Result type alias for dongl operations.
pub type Result<T> = std::result::Result<T, Error>;
