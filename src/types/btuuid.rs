//! Bluetooth UUID helpers.

use uuid::Uuid;

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

/// Expands a 16-bit assigned number into a full UUID.
#[must_use]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expands a 32-bit assigned number into a full UUID.
#[must_use]
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Builds a UUID from 16 bytes in over-the-air (little-endian) order.
#[must_use]
pub fn uuid_from_le_bytes(bytes: [u8; 16]) -> Uuid {
    Uuid::from_u128(u128::from_le_bytes(bytes))
}
