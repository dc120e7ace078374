//! Data types shared by the protocol and the peripheral model.
//!
//! - Bluetooth addresses and address types
//! - Bluetooth UUID helpers
//! - Immutable GATT snapshots (services, characteristics, descriptors)

pub mod address;
pub mod btuuid;
pub mod gatt;

pub use address::{AddressType, BluetoothAddress};
pub use btuuid::{CCCD_UUID, uuid_from_le_bytes, uuid_from_u16, uuid_from_u32};
pub use gatt::{Characteristic, CharacteristicProperties, Descriptor, Service};

/// Raw payload exchanged with a peripheral.
pub type ByteArray = bytes::Bytes;
