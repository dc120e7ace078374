//! Immutable GATT snapshots handed out to callers.
//!
//! These are copies of the peripheral's attribute table taken at the time of
//! the call; they never change after being returned.

use uuid::Uuid;

use crate::types::ByteArray;

/// Characteristic property flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    /// Value can be read.
    pub read: bool,
    /// Value can be written with a response (write request).
    pub write_request: bool,
    /// Value can be written without a response (write command).
    pub write_command: bool,
    /// Value changes can be notified.
    pub notify: bool,
    /// Value changes can be indicated.
    pub indicate: bool,
}

impl CharacteristicProperties {
    const READ: u8 = 0x02;
    const WRITE_COMMAND: u8 = 0x04;
    const WRITE_REQUEST: u8 = 0x08;
    const NOTIFY: u8 = 0x10;
    const INDICATE: u8 = 0x20;

    /// Parses the properties byte of a characteristic declaration.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & Self::READ != 0,
            write_request: bits & Self::WRITE_REQUEST != 0,
            write_command: bits & Self::WRITE_COMMAND != 0,
            notify: bits & Self::NOTIFY != 0,
            indicate: bits & Self::INDICATE != 0,
        }
    }

    /// Encodes the properties back into declaration bits.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.read {
            bits |= Self::READ;
        }
        if self.write_request {
            bits |= Self::WRITE_REQUEST;
        }
        if self.write_command {
            bits |= Self::WRITE_COMMAND;
        }
        if self.notify {
            bits |= Self::NOTIFY;
        }
        if self.indicate {
            bits |= Self::INDICATE;
        }
        bits
    }
}

/// A descriptor snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor UUID.
    pub uuid: Uuid,
}

/// A characteristic snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptors, in handle order.
    pub descriptors: Vec<Descriptor>,
    /// Property flags.
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    /// Returns true if the value can be read.
    #[must_use]
    pub const fn can_read(&self) -> bool {
        self.properties.read
    }

    /// Returns true if the value can be written with a response.
    #[must_use]
    pub const fn can_write_request(&self) -> bool {
        self.properties.write_request
    }

    /// Returns true if the value can be written without a response.
    #[must_use]
    pub const fn can_write_command(&self) -> bool {
        self.properties.write_command
    }

    /// Returns true if the value supports notifications.
    #[must_use]
    pub const fn can_notify(&self) -> bool {
        self.properties.notify
    }

    /// Returns true if the value supports indications.
    #[must_use]
    pub const fn can_indicate(&self) -> bool {
        self.properties.indicate
    }
}

/// A service snapshot.
///
/// Discovered services carry characteristics; advertised services carry the
/// service data from the advertisement instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics, in handle order.
    pub characteristics: Vec<Characteristic>,
    /// Advertised service data.
    pub data: ByteArray,
}

impl Service {
    /// Creates a service snapshot from discovered characteristics.
    #[must_use]
    pub fn discovered(uuid: Uuid, characteristics: Vec<Characteristic>) -> Self {
        Self {
            uuid,
            characteristics,
            data: ByteArray::new(),
        }
    }

    /// Creates a service snapshot from advertised service data.
    #[must_use]
    pub fn advertised(uuid: Uuid, data: ByteArray) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
            data,
        }
    }
}
