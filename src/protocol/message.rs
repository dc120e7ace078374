//! Messages received from the dongle.
//!
//! Every decoded frame starts with a discriminant tag:
//! ```text
//! [0x01] [opcode] [ret_code:4LE] [fields...]   response to the pending command
//! [0x02] [opcode] [fields...]                  unsolicited event
//! ```
//!
//! UUID fields travel as `[width:1] [bytes LE]` where width is 0 (unknown),
//! 2, 4 or 16.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::protocol::advertising::AdvertisingReport;
use crate::protocol::command::CommandOpcode;
use crate::types::{
    AddressType, BluetoothAddress, CharacteristicProperties, uuid_from_le_bytes, uuid_from_u16,
    uuid_from_u32,
};

/// Discriminant tag of a response message.
pub const TAG_RESPONSE: u8 = 0x01;
/// Discriminant tag of an event message.
pub const TAG_EVENT: u8 = 0x02;

/// Event opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventOpcode {
    /// Advertisement sighting.
    Advertisement = 0x20,
    /// Connection established.
    Connected = 0x21,
    /// Connection terminated.
    Disconnected = 0x22,
    /// Batch of discovered attributes.
    AttributeFound = 0x23,
    /// Notification or indication received.
    ValueChanged = 0x24,
}

impl EventOpcode {
    /// Attempts to parse an event opcode from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(Self::Advertisement),
            0x21 => Some(Self::Connected),
            0x22 => Some(Self::Disconnected),
            0x23 => Some(Self::AttributeFound),
            0x24 => Some(Self::ValueChanged),
            _ => None,
        }
    }
}

const RECORD_SERVICE: u8 = 0x01;
const RECORD_CHARACTERISTIC: u8 = 0x02;
const RECORD_DESCRIPTOR: u8 = 0x03;

/// Response to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Firmware identification.
    Whoami { ret_code: u32, firmware: String },
    /// Reset acknowledged.
    Reset { ret_code: u32 },
    /// Stack initialized.
    Init { ret_code: u32 },
    /// Scan started.
    ScanStart { ret_code: u32 },
    /// Scan stopped.
    ScanStop { ret_code: u32 },
    /// Connection attempt accepted.
    Connect { ret_code: u32 },
    /// Disconnection accepted.
    Disconnect { ret_code: u32 },
    /// Attribute value read.
    Read { ret_code: u32, data: Bytes },
    /// Attribute value written.
    Write { ret_code: u32 },
}

impl Response {
    /// Opcode of the command this response answers.
    #[must_use]
    pub const fn opcode(&self) -> CommandOpcode {
        match self {
            Self::Whoami { .. } => CommandOpcode::Whoami,
            Self::Reset { .. } => CommandOpcode::Reset,
            Self::Init { .. } => CommandOpcode::Init,
            Self::ScanStart { .. } => CommandOpcode::ScanStart,
            Self::ScanStop { .. } => CommandOpcode::ScanStop,
            Self::Connect { .. } => CommandOpcode::Connect,
            Self::Disconnect { .. } => CommandOpcode::Disconnect,
            Self::Read { .. } => CommandOpcode::Read,
            Self::Write { .. } => CommandOpcode::Write,
        }
    }

    /// Return code reported by the dongle; zero is success.
    #[must_use]
    pub const fn ret_code(&self) -> u32 {
        match self {
            Self::Whoami { ret_code, .. }
            | Self::Reset { ret_code }
            | Self::Init { ret_code }
            | Self::ScanStart { ret_code }
            | Self::ScanStop { ret_code }
            | Self::Connect { ret_code }
            | Self::Disconnect { ret_code }
            | Self::Read { ret_code, .. }
            | Self::Write { ret_code } => *ret_code,
        }
    }
}

/// A discovered attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeRecord {
    /// Primary service declaration.
    Service {
        uuid: Option<Uuid>,
        start_handle: u16,
        end_handle: u16,
    },
    /// Characteristic declaration.
    Characteristic {
        uuid: Option<Uuid>,
        handle_decl: u16,
        handle_value: u16,
        properties: CharacteristicProperties,
    },
    /// Characteristic descriptor.
    Descriptor { uuid: Option<Uuid>, handle: u16 },
}

/// Unsolicited event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Advertisement sighting.
    Advertisement(AdvertisingReport),
    /// Connection established.
    Connected {
        conn_handle: u16,
        address_type: AddressType,
        address: BluetoothAddress,
    },
    /// Connection terminated.
    Disconnected { conn_handle: u16, reason: u8 },
    /// Batch of discovered attributes.
    AttributeFound {
        conn_handle: u16,
        records: Vec<AttributeRecord>,
        is_last: bool,
    },
    /// Notification or indication received.
    ValueChanged {
        conn_handle: u16,
        handle: u16,
        data: Bytes,
    },
}

/// A decoded dongle message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Fulfills the pending exchange.
    Response(Response),
    /// Dispatched to the event callback.
    Event(Event),
}

/// Bounds-checked little-endian reader over a frame payload.
struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn take(&mut self, what: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        let got = self.raw.len() - self.pos;
        if got < needed {
            return Err(DecodeError::Truncated {
                what,
                needed,
                got,
                raw: self.raw.to_vec(),
            });
        }
        let slice = &self.raw[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(what, 1)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(what, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(what, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bool(&mut self, what: &'static str) -> Result<bool, DecodeError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidValue { what, value }),
        }
    }

    fn address(&mut self) -> Result<BluetoothAddress, DecodeError> {
        let b = self.take("address", 6)?;
        Ok(BluetoothAddress::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5],
        ]))
    }

    fn blob(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let len = usize::from(self.u16(what)?);
        Ok(Bytes::copy_from_slice(self.take(what, len)?))
    }

    fn uuid(&mut self) -> Result<Option<Uuid>, DecodeError> {
        match self.u8("uuid width")? {
            0 => Ok(None),
            2 => Ok(Some(uuid_from_u16(self.u16("uuid16")?))),
            4 => Ok(Some(uuid_from_u32(self.u32("uuid32")?))),
            16 => {
                let mut le = [0u8; 16];
                le.copy_from_slice(self.take("uuid128", 16)?);
                Ok(Some(uuid_from_le_bytes(le)))
            }
            value => Err(DecodeError::InvalidValue {
                what: "uuid width",
                value,
            }),
        }
    }
}

impl Message {
    /// Decodes a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] describing the tag, opcode or field that
    /// could not be decoded.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(raw);
        let tag = reader.u8("tag").map_err(|_| DecodeError::Empty)?;
        let opcode = reader.u8("opcode")?;

        match tag {
            TAG_RESPONSE => decode_response(opcode, &mut reader).map(Self::Response),
            TAG_EVENT => decode_event(opcode, &mut reader).map(Self::Event),
            tag => Err(DecodeError::UnknownTag { tag }),
        }
    }

    /// Encodes the message into a frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Response(response) => {
                buf.put_u8(TAG_RESPONSE);
                buf.put_u8(response.opcode().into());
                buf.put_u32_le(response.ret_code());
                match response {
                    Response::Whoami { firmware, .. } => put_blob(&mut buf, firmware.as_bytes()),
                    Response::Read { data, .. } => put_blob(&mut buf, data),
                    _ => {}
                }
            }
            Self::Event(event) => encode_event(&mut buf, event),
        }
        buf.freeze()
    }
}

fn decode_response(opcode: u8, reader: &mut Reader<'_>) -> Result<Response, DecodeError> {
    let command = CommandOpcode::from_byte(opcode).ok_or(DecodeError::UnknownOpcode {
        kind: "response",
        opcode,
    })?;
    let ret_code = reader.u32("ret_code")?;

    Ok(match command {
        CommandOpcode::Whoami => {
            let firmware = reader.blob("firmware")?;
            Response::Whoami {
                ret_code,
                firmware: String::from_utf8_lossy(&firmware).into_owned(),
            }
        }
        CommandOpcode::Reset => Response::Reset { ret_code },
        CommandOpcode::Init => Response::Init { ret_code },
        CommandOpcode::ScanStart => Response::ScanStart { ret_code },
        CommandOpcode::ScanStop => Response::ScanStop { ret_code },
        CommandOpcode::Connect => Response::Connect { ret_code },
        CommandOpcode::Disconnect => Response::Disconnect { ret_code },
        CommandOpcode::Read => Response::Read {
            ret_code,
            data: reader.blob("read data")?,
        },
        CommandOpcode::Write => Response::Write { ret_code },
    })
}

fn decode_event(opcode: u8, reader: &mut Reader<'_>) -> Result<Event, DecodeError> {
    let event = EventOpcode::from_byte(opcode).ok_or(DecodeError::UnknownOpcode {
        kind: "event",
        opcode,
    })?;

    Ok(match event {
        EventOpcode::Advertisement => {
            let address_type = AddressType::from_byte(reader.u8("address type")?);
            let address = reader.address()?;
            let rssi = reader.u8("rssi")? as i8;
            let connectable = reader.bool("connectable")?;
            let data = reader.blob("advertising data")?;
            Event::Advertisement(AdvertisingReport {
                address_type,
                address,
                rssi,
                connectable,
                data,
            })
        }
        EventOpcode::Connected => Event::Connected {
            conn_handle: reader.u16("conn_handle")?,
            address_type: AddressType::from_byte(reader.u8("address type")?),
            address: reader.address()?,
        },
        EventOpcode::Disconnected => Event::Disconnected {
            conn_handle: reader.u16("conn_handle")?,
            reason: reader.u8("reason")?,
        },
        EventOpcode::AttributeFound => {
            let conn_handle = reader.u16("conn_handle")?;
            let is_last = reader.bool("is_last")?;
            let count = reader.u8("record count")?;
            let records = (0..count)
                .map(|_| decode_record(reader))
                .collect::<Result<Vec<_>, _>>()?;
            Event::AttributeFound {
                conn_handle,
                records,
                is_last,
            }
        }
        EventOpcode::ValueChanged => Event::ValueChanged {
            conn_handle: reader.u16("conn_handle")?,
            handle: reader.u16("handle")?,
            data: reader.blob("value")?,
        },
    })
}

fn decode_record(reader: &mut Reader<'_>) -> Result<AttributeRecord, DecodeError> {
    match reader.u8("record kind")? {
        RECORD_SERVICE => Ok(AttributeRecord::Service {
            uuid: reader.uuid()?,
            start_handle: reader.u16("start_handle")?,
            end_handle: reader.u16("end_handle")?,
        }),
        RECORD_CHARACTERISTIC => Ok(AttributeRecord::Characteristic {
            uuid: reader.uuid()?,
            handle_decl: reader.u16("handle_decl")?,
            handle_value: reader.u16("handle_value")?,
            properties: CharacteristicProperties::from_bits(reader.u8("properties")?),
        }),
        RECORD_DESCRIPTOR => Ok(AttributeRecord::Descriptor {
            uuid: reader.uuid()?,
            handle: reader.u16("handle")?,
        }),
        value => Err(DecodeError::InvalidValue {
            what: "record kind",
            value,
        }),
    }
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn put_uuid(buf: &mut BytesMut, uuid: Option<Uuid>) {
    let Some(uuid) = uuid else {
        buf.put_u8(0);
        return;
    };
    buf.put_u8(16);
    buf.put_u128_le(uuid.as_u128());
}

fn encode_event(buf: &mut BytesMut, event: &Event) {
    buf.put_u8(TAG_EVENT);
    match event {
        Event::Advertisement(report) => {
            buf.put_u8(EventOpcode::Advertisement as u8);
            buf.put_u8(report.address_type.into());
            buf.put_slice(&report.address.to_le_bytes());
            buf.put_i8(report.rssi);
            buf.put_u8(u8::from(report.connectable));
            put_blob(buf, &report.data);
        }
        Event::Connected {
            conn_handle,
            address_type,
            address,
        } => {
            buf.put_u8(EventOpcode::Connected as u8);
            buf.put_u16_le(*conn_handle);
            buf.put_u8((*address_type).into());
            buf.put_slice(&address.to_le_bytes());
        }
        Event::Disconnected {
            conn_handle,
            reason,
        } => {
            buf.put_u8(EventOpcode::Disconnected as u8);
            buf.put_u16_le(*conn_handle);
            buf.put_u8(*reason);
        }
        Event::AttributeFound {
            conn_handle,
            records,
            is_last,
        } => {
            buf.put_u8(EventOpcode::AttributeFound as u8);
            buf.put_u16_le(*conn_handle);
            buf.put_u8(u8::from(*is_last));
            buf.put_u8(records.len() as u8);
            for record in records {
                match record {
                    AttributeRecord::Service {
                        uuid,
                        start_handle,
                        end_handle,
                    } => {
                        buf.put_u8(RECORD_SERVICE);
                        put_uuid(buf, *uuid);
                        buf.put_u16_le(*start_handle);
                        buf.put_u16_le(*end_handle);
                    }
                    AttributeRecord::Characteristic {
                        uuid,
                        handle_decl,
                        handle_value,
                        properties,
                    } => {
                        buf.put_u8(RECORD_CHARACTERISTIC);
                        put_uuid(buf, *uuid);
                        buf.put_u16_le(*handle_decl);
                        buf.put_u16_le(*handle_value);
                        buf.put_u8(properties.to_bits());
                    }
                    AttributeRecord::Descriptor { uuid, handle } => {
                        buf.put_u8(RECORD_DESCRIPTOR);
                        put_uuid(buf, *uuid);
                        buf.put_u16_le(*handle);
                    }
                }
            }
        }
        Event::ValueChanged {
            conn_handle,
            handle,
            data,
        } => {
            buf.put_u8(EventOpcode::ValueChanged as u8);
            buf.put_u16_le(*conn_handle);
            buf.put_u16_le(*handle);
            put_blob(buf, data);
        }
    }
}
