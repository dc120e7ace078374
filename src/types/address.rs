//! Bluetooth device addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Bluetooth address type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressType {
    /// Public (IEEE-assigned) address.
    Public = 0x00,
    /// Random (static or private) address.
    Random = 0x01,
    /// Unknown address type.
    #[default]
    Unspecified = 0x02,
}

impl AddressType {
    /// Parses an address type from a byte, mapping unknown values to
    /// [`AddressType::Unspecified`].
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Public,
            0x01 => Self::Random,
            _ => Self::Unspecified,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(kind: AddressType) -> Self {
        kind as Self
    }
}

/// A 48-bit Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BluetoothAddress([u8; 6]);

impl BluetoothAddress {
    /// Creates an address from bytes in display order.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Creates an address from over-the-air (little-endian) byte order.
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 6]) -> Self {
        Self([bytes[5], bytes[4], bytes[3], bytes[2], bytes[1], bytes[0]])
    }

    /// Returns the address in over-the-air (little-endian) byte order.
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 6] {
        let b = self.0;
        [b[5], b[4], b[3], b[2], b[1], b[0]]
    }

    /// Returns the address bytes in display order.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BluetoothAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress {
            address: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}
