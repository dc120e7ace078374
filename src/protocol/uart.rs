//! Flat UART command set spoken by older dongle firmware.
//!
//! Frame layout:
//! ```text
//! [0x05] [op] [len:2LE] [payload...] [crc:2LE]
//! ```
//!
//! The CRC is [`crc16_command`] over every byte before it, start byte
//! included.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::protocol::crc::crc16_command;

/// First byte of every UART frame.
pub const UART_START_BYTE: u8 = 0x05;

/// Start byte, opcode and length.
const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 2;

const STATUS_LEN: usize = 2;
const VERSION_LEN: usize = 4;
const TRANSMIT_BUFFER_LEN: usize = 1;
const DEVICE_ID_LEN: usize = 6;
const DEVICE_NAME_MAX_LEN: usize = 8;
const SCAN_RESULT_MIN_LEN: usize = 7;
const SCAN_RESULT_MAX_LEN: usize = 15;
const RX_DATA_MAX_LEN: usize = 513;
const ECHO_MAX_LEN: usize = 513;

/// A UART command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartCommand {
    Reboot,
    ReadVersion,
    ReadTransmitBuffer,
    ReadDeviceId,
    FactoryReset,
    SetDeviceName(String),
    ReadDeviceName,
    StartScanning,
    StopScanning,
    ConnectDataConnection { peer_handle: u8, peer_address: [u8; 6] },
    DisconnectDataConnection { peer_handle: u8 },
    TxData { peer_handle: u8, data: Bytes },
    Echo(Bytes),
}

impl UartCommand {
    /// Opcode of this command.
    #[must_use]
    pub const fn op_code(&self) -> u8 {
        match self {
            Self::Reboot => 0x00,
            Self::ReadVersion => 0x01,
            Self::ReadTransmitBuffer => 0x02,
            Self::ReadDeviceId => 0x03,
            Self::FactoryReset => 0x0F,
            Self::SetDeviceName(_) => 0x12,
            Self::ReadDeviceName => 0x13,
            Self::StartScanning => 0x20,
            Self::StopScanning => 0x21,
            Self::ConnectDataConnection { .. } => 0x31,
            Self::DisconnectDataConnection { .. } => 0x32,
            Self::TxData { .. } => 0x36,
            Self::Echo(_) => 0x70,
        }
    }

    fn payload(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        match self {
            Self::SetDeviceName(name) => payload.put_slice(name.as_bytes()),
            Self::ConnectDataConnection {
                peer_handle,
                peer_address,
            } => {
                payload.put_u8(*peer_handle);
                payload.put_slice(peer_address);
            }
            Self::DisconnectDataConnection { peer_handle } => payload.put_u8(*peer_handle),
            Self::TxData { peer_handle, data } => {
                payload.put_u8(*peer_handle);
                payload.put_slice(data);
            }
            Self::Echo(data) => payload.put_slice(data),
            _ => {}
        }
        payload
    }

    /// Serializes the command into a complete UART frame.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let payload = self.payload();
        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        frame.put_u8(UART_START_BYTE);
        frame.put_u8(self.op_code());
        frame.put_u16_le(payload.len() as u16);
        frame.put_slice(&payload);
        let crc = crc16_command(&frame);
        frame.put_u16_le(crc);
        frame.freeze()
    }
}

/// A UART event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartEvent {
    /// Outcome of a command.
    Status { status_op_code: u8, status: u8 },
    /// Hardware and firmware version.
    Version {
        hw_version: u8,
        major: u8,
        minor: u8,
        bugfix: u8,
    },
    /// Number of free transmit buffers.
    TransmitBuffer { available: u8 },
    /// Device identifier.
    DeviceId([u8; 6]),
    /// Advertised device name.
    DeviceName(String),
    /// Scan sighting.
    ScanResult {
        address: [u8; 6],
        rssi: i8,
        name: String,
    },
    /// Data received on a data connection.
    RxData { peer_handle: u8, data: Bytes },
    /// Echo reply.
    Echo(Bytes),
}

impl UartEvent {
    /// Opcode of this event.
    #[must_use]
    pub const fn op_code(&self) -> u8 {
        match self {
            Self::Status { .. } => 0x80,
            Self::Version { .. } => 0x81,
            Self::TransmitBuffer { .. } => 0x82,
            Self::DeviceId(_) => 0x83,
            Self::DeviceName(_) => 0x93,
            Self::ScanResult { .. } => 0xA0,
            Self::RxData { .. } => 0xB6,
            Self::Echo(_) => 0xF0,
        }
    }

    /// Parses a complete UART frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::StartByte`] if the frame does not begin with
    /// [`UART_START_BYTE`], [`DecodeError::Crc`] on a checksum mismatch, and
    /// [`DecodeError::PayloadLength`] if the opcode is unknown or its payload
    /// has the wrong size.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.first() != Some(&UART_START_BYTE) {
            return Err(DecodeError::StartByte { raw: raw.to_vec() });
        }
        if raw.len() < HEADER_LEN + CRC_LEN {
            return Err(DecodeError::Truncated {
                what: "uart frame",
                needed: HEADER_LEN + CRC_LEN,
                got: raw.len(),
                raw: raw.to_vec(),
            });
        }

        let (body, crc) = raw.split_at(raw.len() - CRC_LEN);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        let computed = crc16_command(body);
        if received != computed {
            return Err(DecodeError::Crc {
                raw: raw.to_vec(),
                received,
                computed,
            });
        }

        let op_code = body[1];
        let payload = &body[HEADER_LEN..];
        let bad_length = || DecodeError::PayloadLength {
            op_code,
            payload: payload.to_vec(),
        };

        match op_code {
            0x80 if payload.len() == STATUS_LEN => Ok(Self::Status {
                status_op_code: payload[0],
                status: payload[1],
            }),
            0x81 if payload.len() == VERSION_LEN => Ok(Self::Version {
                hw_version: payload[0],
                major: payload[1],
                minor: payload[2],
                bugfix: payload[3],
            }),
            0x82 if payload.len() == TRANSMIT_BUFFER_LEN => Ok(Self::TransmitBuffer {
                available: payload[0],
            }),
            0x83 => {
                let id: [u8; DEVICE_ID_LEN] = payload.try_into().map_err(|_| bad_length())?;
                Ok(Self::DeviceId(id))
            }
            0x93 if (1..=DEVICE_NAME_MAX_LEN).contains(&payload.len()) => Ok(Self::DeviceName(
                String::from_utf8_lossy(payload).into_owned(),
            )),
            0xA0 if (SCAN_RESULT_MIN_LEN..=SCAN_RESULT_MAX_LEN).contains(&payload.len()) => {
                let mut address = [0u8; 6];
                address.copy_from_slice(&payload[..6]);
                Ok(Self::ScanResult {
                    address,
                    rssi: payload[6] as i8,
                    name: String::from_utf8_lossy(&payload[7..]).into_owned(),
                })
            }
            0xB6 if !payload.is_empty() && payload.len() <= RX_DATA_MAX_LEN => Ok(Self::RxData {
                peer_handle: payload[0],
                data: Bytes::copy_from_slice(&payload[1..]),
            }),
            0xF0 if payload.len() <= ECHO_MAX_LEN => Ok(Self::Echo(Bytes::copy_from_slice(payload))),
            _ => Err(bad_length()),
        }
    }
}
