//! Commands sent to the dongle.
//!
//! Each command is a single opcode byte, followed by its parameters in
//! little-endian order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{AddressType, BluetoothAddress};

/// Command opcodes sent to the dongle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandOpcode {
    /// Identify the dongle firmware.
    Whoami = 0x01,
    /// Reset the dongle.
    Reset = 0x02,
    /// Initialize the BLE stack.
    Init = 0x10,
    /// Start scanning.
    ScanStart = 0x11,
    /// Stop scanning.
    ScanStop = 0x12,
    /// Connect to a peripheral.
    Connect = 0x13,
    /// Disconnect from a peripheral.
    Disconnect = 0x14,
    /// Read an attribute.
    Read = 0x15,
    /// Write an attribute.
    Write = 0x16,
}

impl CommandOpcode {
    /// Attempts to parse an opcode from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Whoami),
            0x02 => Some(Self::Reset),
            0x10 => Some(Self::Init),
            0x11 => Some(Self::ScanStart),
            0x12 => Some(Self::ScanStop),
            0x13 => Some(Self::Connect),
            0x14 => Some(Self::Disconnect),
            0x15 => Some(Self::Read),
            0x16 => Some(Self::Write),
            _ => None,
        }
    }

    /// Human-readable command name, used in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Whoami => "whoami",
            Self::Reset => "reset",
            Self::Init => "init",
            Self::ScanStart => "scan_start",
            Self::ScanStop => "scan_stop",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl From<CommandOpcode> for u8 {
    fn from(cmd: CommandOpcode) -> Self {
        cmd as Self
    }
}

/// Attribute write kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WriteOperation {
    /// Write with response.
    WriteRequest = 0x01,
    /// Write without response.
    WriteCommand = 0x02,
}

impl WriteOperation {
    /// Attempts to parse a write operation from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::WriteRequest),
            0x02 => Some(Self::WriteCommand),
            _ => None,
        }
    }
}

/// A command sent to the dongle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identify the dongle firmware.
    Whoami,
    /// Reset the dongle.
    Reset,
    /// Initialize the BLE stack.
    Init,
    /// Start scanning.
    ScanStart,
    /// Stop scanning.
    ScanStop,
    /// Connect to a peripheral.
    Connect {
        address_type: AddressType,
        address: BluetoothAddress,
    },
    /// Disconnect a connection.
    Disconnect { conn_handle: u16 },
    /// Read an attribute value.
    Read { conn_handle: u16, handle: u16 },
    /// Write an attribute value.
    Write {
        conn_handle: u16,
        handle: u16,
        op: WriteOperation,
        data: Bytes,
    },
}

impl Command {
    /// Returns the opcode of this command.
    #[must_use]
    pub const fn opcode(&self) -> CommandOpcode {
        match self {
            Self::Whoami => CommandOpcode::Whoami,
            Self::Reset => CommandOpcode::Reset,
            Self::Init => CommandOpcode::Init,
            Self::ScanStart => CommandOpcode::ScanStart,
            Self::ScanStop => CommandOpcode::ScanStop,
            Self::Connect { .. } => CommandOpcode::Connect,
            Self::Disconnect { .. } => CommandOpcode::Disconnect,
            Self::Read { .. } => CommandOpcode::Read,
            Self::Write { .. } => CommandOpcode::Write,
        }
    }

    /// Encodes the command.
    ///
    /// Format:
    /// ```text
    /// Connect:    [op] [addr_type:1] [addr:6 LE]
    /// Disconnect: [op] [conn:2LE]
    /// Read:       [op] [conn:2LE] [handle:2LE]
    /// Write:      [op] [conn:2LE] [handle:2LE] [write_op:1] [len:2LE] [data...]
    /// others:     [op]
    /// ```
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.opcode().into());

        match self {
            Self::Whoami | Self::Reset | Self::Init | Self::ScanStart | Self::ScanStop => {}
            Self::Connect {
                address_type,
                address,
            } => {
                buf.put_u8((*address_type).into());
                buf.put_slice(&address.to_le_bytes());
            }
            Self::Disconnect { conn_handle } => {
                buf.put_u16_le(*conn_handle);
            }
            Self::Read {
                conn_handle,
                handle,
            } => {
                buf.put_u16_le(*conn_handle);
                buf.put_u16_le(*handle);
            }
            Self::Write {
                conn_handle,
                handle,
                op,
                data,
            } => {
                buf.put_u16_le(*conn_handle);
                buf.put_u16_le(*handle);
                buf.put_u8(*op as u8);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
        }

        buf.freeze()
    }
}
