//! Protocol definitions for the dongle link.
//!
//! This module contains the low-level protocol types including:
//! - Wire framing and the two CRC-16 variants
//! - Command encoding and response/event decoding
//! - Advertising data parsing
//! - The legacy flat UART command set

pub mod advertising;
pub mod command;
pub mod crc;
pub mod frame;
pub mod message;
pub mod uart;

pub use advertising::{AdvertisingData, AdvertisingReport};
pub use command::{Command, CommandOpcode, WriteOperation};
pub use crc::{crc16_command, crc16_wire};
pub use frame::{FrameDecoder, FrameState, MAX_PAYLOAD_SIZE, SYNC_BYTE, encode as encode_frame};
pub use message::{AttributeRecord, Event, EventOpcode, Message, Response};
pub use uart::{UartCommand, UartEvent};
