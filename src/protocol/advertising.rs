//! Advertising reports and AD structure parsing.

use std::collections::BTreeMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::types::{AddressType, BluetoothAddress, uuid_from_le_bytes, uuid_from_u16};

/// AD type: shortened local name.
pub const AD_SHORT_NAME: u8 = 0x08;
/// AD type: complete local name.
pub const AD_COMPLETE_NAME: u8 = 0x09;
/// AD type: TX power level.
pub const AD_TX_POWER: u8 = 0x0A;
/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_INCOMPLETE_UUID16: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_COMPLETE_UUID16: u8 = 0x03;
/// AD type: incomplete list of 128-bit service UUIDs.
pub const AD_INCOMPLETE_UUID128: u8 = 0x06;
/// AD type: complete list of 128-bit service UUIDs.
pub const AD_COMPLETE_UUID128: u8 = 0x07;
/// AD type: service data with a 16-bit UUID.
pub const AD_SERVICE_DATA_UUID16: u8 = 0x16;
/// AD type: manufacturer specific data.
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// A single advertisement sighting reported by the dongle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    /// Advertiser address type.
    pub address_type: AddressType,
    /// Advertiser address.
    pub address: BluetoothAddress,
    /// Received signal strength in dBm.
    pub rssi: i8,
    /// Whether the advertisement was connectable.
    pub connectable: bool,
    /// Raw AD structures.
    pub data: Bytes,
}

impl AdvertisingReport {
    /// Parses the AD structures carried by this report.
    #[must_use]
    pub fn parse(&self) -> AdvertisingData {
        AdvertisingData::parse(&self.data)
    }
}

/// Fields extracted from AD structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    /// Local name, complete or shortened.
    pub identifier: Option<String>,
    /// Advertised TX power in dBm.
    pub tx_power: Option<i8>,
    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Bytes>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by service UUID.
    pub service_data: BTreeMap<Uuid, Bytes>,
}

impl AdvertisingData {
    /// Parses a sequence of `[len][type][data...]` AD structures.
    ///
    /// Parsing stops at a zero length or at a structure running past the end
    /// of the buffer; everything decoded up to that point is kept.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut parsed = Self::default();
        let mut rest = raw;

        while let Some((&len, tail)) = rest.split_first() {
            let len = usize::from(len);
            if len == 0 || tail.len() < len {
                break;
            }
            let (structure, next) = tail.split_at(len);
            rest = next;

            let ad_type = structure[0];
            let value = &structure[1..];
            parsed.apply(ad_type, value);
        }

        parsed
    }

    fn apply(&mut self, ad_type: u8, value: &[u8]) {
        match ad_type {
            AD_COMPLETE_NAME => {
                self.identifier = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_SHORT_NAME => {
                if self.identifier.is_none() {
                    self.identifier = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            AD_TX_POWER => {
                if let Some(&power) = value.first() {
                    self.tx_power = Some(power as i8);
                }
            }
            AD_MANUFACTURER_DATA if value.len() >= 2 => {
                let company_id = u16::from_le_bytes([value[0], value[1]]);
                self.manufacturer_data
                    .insert(company_id, Bytes::copy_from_slice(&value[2..]));
            }
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                self.service_uuids.extend(
                    value
                        .chunks_exact(2)
                        .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]]))),
                );
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in value.chunks_exact(16) {
                    let mut le = [0u8; 16];
                    le.copy_from_slice(chunk);
                    self.service_uuids.push(uuid_from_le_bytes(le));
                }
            }
            AD_SERVICE_DATA_UUID16 if value.len() >= 2 => {
                let uuid = uuid_from_u16(u16::from_le_bytes([value[0], value[1]]));
                self.service_data
                    .insert(uuid, Bytes::copy_from_slice(&value[2..]));
            }
            _ => {}
        }
    }
}
