//! Attribute table rebuilt from discovery events.
//!
//! Services are keyed by start handle, characteristics by declaration handle
//! and descriptors by handle. A characteristic belongs to the service whose
//! `[start_handle, end_handle]` contains its declaration handle. A descriptor
//! belongs to the characteristic whose `[handle_decl, handle_value]` contains
//! its handle.
//!
//! That descriptor range stops at the value handle, so a descriptor placed
//! after the value handle has no owner and is dropped when discovery
//! completes. Whether the firmware ever reports such descriptors is unknown;
//! the rule is kept as the dongle defines it.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::AttributeRecord;
use crate::types::{
    CCCD_UUID, Characteristic, CharacteristicProperties, Descriptor, Service,
};

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDefinition {
    /// Descriptor UUID, if reported.
    pub uuid: Option<Uuid>,
    /// Attribute handle.
    pub handle: u16,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    /// Characteristic UUID, if known.
    pub uuid: Option<Uuid>,
    /// Declaration handle.
    pub handle_decl: u16,
    /// Value handle.
    pub handle_value: u16,
    /// Property flags.
    pub properties: CharacteristicProperties,
    /// Handle of the client configuration descriptor, once seen.
    pub handle_cccd: Option<u16>,
    /// Descriptors keyed by handle.
    pub descriptors: BTreeMap<u16, DescriptorDefinition>,
}

impl CharacteristicDefinition {
    const fn contains(&self, handle: u16) -> bool {
        self.handle_decl <= handle && handle <= self.handle_value
    }

    fn snapshot(&self) -> Option<Characteristic> {
        Some(Characteristic {
            uuid: self.uuid?,
            descriptors: self
                .descriptors
                .values()
                .filter_map(|d| d.uuid.map(|uuid| Descriptor { uuid }))
                .collect(),
            properties: self.properties,
        })
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Service UUID, if known.
    pub uuid: Option<Uuid>,
    /// First handle of the service.
    pub start_handle: u16,
    /// Last handle of the service.
    pub end_handle: u16,
    /// Characteristics keyed by declaration handle.
    pub characteristics: BTreeMap<u16, CharacteristicDefinition>,
}

impl ServiceDefinition {
    const fn contains(&self, handle: u16) -> bool {
        self.start_handle <= handle && handle <= self.end_handle
    }

    fn characteristic_containing(&mut self, handle: u16) -> Option<&mut CharacteristicDefinition> {
        self.characteristics
            .range_mut(..=handle)
            .next_back()
            .map(|(_, characteristic)| characteristic)
            .filter(|characteristic| characteristic.contains(handle))
    }

    fn snapshot(&self) -> Option<Service> {
        Some(Service::discovered(
            self.uuid?,
            self.characteristics
                .values()
                .filter_map(CharacteristicDefinition::snapshot)
                .collect(),
        ))
    }
}

/// The attribute table of one connection.
#[derive(Debug, Default)]
pub struct AttributeTree {
    services: BTreeMap<u16, ServiceDefinition>,
    orphans: Vec<AttributeRecord>,
    complete: bool,
}

impl AttributeTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no service has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns true once the final batch has been ingested.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Discards everything.
    pub fn clear(&mut self) {
        self.services.clear();
        self.orphans.clear();
        self.complete = false;
    }

    /// Adds a batch of records.
    ///
    /// Records whose parent has not arrived yet are held back and placed as
    /// soon as it does. When `is_last` is set, anything still unplaced is
    /// dropped and the tree is marked complete.
    pub fn ingest(&mut self, records: Vec<AttributeRecord>, is_last: bool) {
        self.orphans.extend(records);

        loop {
            let before = self.orphans.len();
            let pending = std::mem::take(&mut self.orphans);
            for record in pending {
                if let Err(record) = self.insert(record) {
                    self.orphans.push(record);
                }
            }
            if self.orphans.is_empty() || self.orphans.len() == before {
                break;
            }
        }

        if is_last {
            for record in self.orphans.drain(..) {
                tracing::warn!("no owner for discovered attribute {:?}", record);
            }
            self.complete = true;
            tracing::debug!("attribute discovery complete: {} services", self.services.len());
        }
    }

    /// Places one record, handing it back if its parent is missing.
    fn insert(&mut self, record: AttributeRecord) -> std::result::Result<(), AttributeRecord> {
        match record {
            AttributeRecord::Service {
                uuid,
                start_handle,
                end_handle,
            } => {
                let service = self
                    .services
                    .entry(start_handle)
                    .or_insert_with(|| ServiceDefinition {
                        uuid,
                        start_handle,
                        end_handle,
                        characteristics: BTreeMap::new(),
                    });
                service.uuid = uuid.or(service.uuid);
                service.end_handle = end_handle;
                Ok(())
            }
            AttributeRecord::Characteristic {
                uuid,
                handle_decl,
                handle_value,
                properties,
            } => {
                let Some(service) = self.service_containing(handle_decl) else {
                    return Err(record);
                };
                let characteristic = service
                    .characteristics
                    .entry(handle_decl)
                    .or_insert_with(|| CharacteristicDefinition {
                        uuid,
                        handle_decl,
                        handle_value,
                        properties,
                        handle_cccd: None,
                        descriptors: BTreeMap::new(),
                    });
                characteristic.uuid = uuid.or(characteristic.uuid);
                characteristic.handle_value = handle_value;
                characteristic.properties = properties;
                Ok(())
            }
            AttributeRecord::Descriptor { uuid, handle } => {
                let Some(characteristic) = self
                    .service_containing(handle)
                    .and_then(|service| service.characteristic_containing(handle))
                else {
                    return Err(record);
                };
                if uuid == Some(CCCD_UUID) {
                    characteristic.handle_cccd = Some(handle);
                }
                characteristic
                    .descriptors
                    .insert(handle, DescriptorDefinition { uuid, handle });
                Ok(())
            }
        }
    }

    fn service_containing(&mut self, handle: u16) -> Option<&mut ServiceDefinition> {
        self.services
            .range_mut(..=handle)
            .next_back()
            .map(|(_, service)| service)
            .filter(|service| service.contains(handle))
    }

    /// Start handles of services whose UUID is unknown.
    #[must_use]
    pub fn unresolved_services(&self) -> Vec<u16> {
        self.services
            .values()
            .filter(|s| s.uuid.is_none())
            .map(|s| s.start_handle)
            .collect()
    }

    /// Declaration handles of characteristics whose UUID is unknown.
    #[must_use]
    pub fn unresolved_characteristics(&self) -> Vec<u16> {
        self.services
            .values()
            .flat_map(|s| s.characteristics.values())
            .filter(|c| c.uuid.is_none())
            .map(|c| c.handle_decl)
            .collect()
    }

    /// Sets the UUID of the service starting at `start_handle`.
    pub fn set_service_uuid(&mut self, start_handle: u16, uuid: Uuid) {
        if let Some(service) = self.services.get_mut(&start_handle) {
            service.uuid = Some(uuid);
        }
    }

    /// Sets the UUID of the characteristic declared at `handle_decl`.
    pub fn set_characteristic_uuid(&mut self, handle_decl: u16, uuid: Uuid) {
        if let Some(characteristic) = self
            .service_containing(handle_decl)
            .and_then(|service| service.characteristics.get_mut(&handle_decl))
        {
            characteristic.uuid = Some(uuid);
        }
    }

    /// Immutable snapshot of every service with a known UUID.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Service> {
        self.services
            .values()
            .filter_map(ServiceDefinition::snapshot)
            .collect()
    }

    /// Finds a characteristic by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] or [`Error::CharacteristicNotFound`].
    pub fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<&CharacteristicDefinition> {
        let definition = self
            .services
            .values()
            .find(|s| s.uuid == Some(service))
            .ok_or(Error::ServiceNotFound { service })?;
        definition
            .characteristics
            .values()
            .find(|c| c.uuid == Some(characteristic))
            .ok_or(Error::CharacteristicNotFound {
                service,
                characteristic,
            })
    }

    /// Finds a descriptor by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`], [`Error::CharacteristicNotFound`]
    /// or [`Error::DescriptorNotFound`].
    pub fn find_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<&DescriptorDefinition> {
        self.find_characteristic(service, characteristic)?
            .descriptors
            .values()
            .find(|d| d.uuid == Some(descriptor))
            .ok_or(Error::DescriptorNotFound {
                service,
                characteristic,
                descriptor,
            })
    }
}

/// Parses a service declaration value into a UUID.
///
/// The value is a 16-bit or 128-bit UUID, little-endian.
#[must_use]
pub fn parse_service_declaration(value: &[u8]) -> Option<Uuid> {
    parse_uuid(value)
}

/// Parses a characteristic declaration value into a UUID.
///
/// Layout: `[properties:1] [value_handle:2LE] [uuid:2 or 16, LE]`.
#[must_use]
pub fn parse_characteristic_declaration(value: &[u8]) -> Option<Uuid> {
    value.get(3..).and_then(parse_uuid)
}

fn parse_uuid(le: &[u8]) -> Option<Uuid> {
    match le.len() {
        2 => Some(crate::types::uuid_from_u16(u16::from_le_bytes([le[0], le[1]]))),
        16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(le);
            Some(crate::types::uuid_from_le_bytes(bytes))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid_from_u16;

    const S: Uuid = uuid_from_u16(0x180F);
    const C: Uuid = uuid_from_u16(0x2A19);
    const D: Uuid = uuid_from_u16(0x2901);

    fn service() -> AttributeRecord {
        AttributeRecord::Service {
            uuid: Some(S),
            start_handle: 5,
            end_handle: 20,
        }
    }

    fn characteristic() -> AttributeRecord {
        AttributeRecord::Characteristic {
            uuid: Some(C),
            handle_decl: 10,
            handle_value: 11,
            properties: CharacteristicProperties::from_bits(0x12),
        }
    }

    fn descriptor() -> AttributeRecord {
        AttributeRecord::Descriptor {
            uuid: Some(D),
            handle: 11,
        }
    }

    fn assert_single_chain(tree: &AttributeTree) {
        let services = tree.snapshot();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, S);
        assert_eq!(services[0].characteristics.len(), 1);
        assert_eq!(services[0].characteristics[0].uuid, C);
        assert_eq!(
            services[0].characteristics[0].descriptors,
            vec![Descriptor { uuid: D }]
        );
    }

    #[test]
    fn test_hierarchy_in_every_order() {
        let orders = [
            [service(), characteristic(), descriptor()],
            [service(), descriptor(), characteristic()],
            [characteristic(), service(), descriptor()],
            [characteristic(), descriptor(), service()],
            [descriptor(), service(), characteristic()],
            [descriptor(), characteristic(), service()],
        ];

        for order in orders {
            let mut tree = AttributeTree::new();
            tree.ingest(order.to_vec(), false);
            assert!(!tree.is_complete());
            tree.ingest(Vec::new(), true);
            assert!(tree.is_complete());
            assert_single_chain(&tree);
        }
    }

    #[test]
    fn test_hierarchy_across_batches() {
        let mut tree = AttributeTree::new();
        tree.ingest(vec![descriptor()], false);
        tree.ingest(vec![characteristic()], false);
        tree.ingest(vec![service()], true);
        assert_single_chain(&tree);
    }

    #[test]
    fn test_descriptor_past_value_handle_is_dropped() {
        let mut tree = AttributeTree::new();
        tree.ingest(
            vec![
                service(),
                characteristic(),
                AttributeRecord::Descriptor {
                    uuid: Some(CCCD_UUID),
                    handle: 12,
                },
            ],
            true,
        );
        let definition = tree.find_characteristic(S, C).unwrap();
        assert!(definition.descriptors.is_empty());
        assert_eq!(definition.handle_cccd, None);
    }

    #[test]
    fn test_cccd_handle_recorded() {
        let mut tree = AttributeTree::new();
        tree.ingest(
            vec![
                service(),
                AttributeRecord::Characteristic {
                    uuid: Some(C),
                    handle_decl: 10,
                    handle_value: 12,
                    properties: CharacteristicProperties::from_bits(0x10),
                },
                AttributeRecord::Descriptor {
                    uuid: Some(CCCD_UUID),
                    handle: 12,
                },
            ],
            true,
        );
        assert_eq!(tree.find_characteristic(S, C).unwrap().handle_cccd, Some(12));
    }

    #[test]
    fn test_characteristic_outside_every_service_is_dropped() {
        let mut tree = AttributeTree::new();
        tree.ingest(
            vec![
                service(),
                AttributeRecord::Characteristic {
                    uuid: Some(C),
                    handle_decl: 30,
                    handle_value: 31,
                    properties: CharacteristicProperties::default(),
                },
            ],
            true,
        );
        assert!(tree.snapshot()[0].characteristics.is_empty());
    }

    #[test]
    fn test_lookup_errors() {
        let mut tree = AttributeTree::new();
        tree.ingest(vec![service(), characteristic(), descriptor()], true);

        let other = uuid_from_u16(0x1234);
        assert!(matches!(
            tree.find_characteristic(other, C),
            Err(Error::ServiceNotFound { .. })
        ));
        assert!(matches!(
            tree.find_characteristic(S, other),
            Err(Error::CharacteristicNotFound { .. })
        ));
        assert!(matches!(
            tree.find_descriptor(S, C, other),
            Err(Error::DescriptorNotFound { .. })
        ));
        assert_eq!(tree.find_descriptor(S, C, D).unwrap().handle, 11);
    }

    #[test]
    fn test_unresolved_uuids() {
        let mut tree = AttributeTree::new();
        tree.ingest(
            vec![
                AttributeRecord::Service {
                    uuid: None,
                    start_handle: 1,
                    end_handle: 4,
                },
                AttributeRecord::Characteristic {
                    uuid: None,
                    handle_decl: 2,
                    handle_value: 3,
                    properties: CharacteristicProperties::default(),
                },
            ],
            true,
        );
        assert_eq!(tree.unresolved_services(), vec![1]);
        assert_eq!(tree.unresolved_characteristics(), vec![2]);
        assert!(tree.snapshot().is_empty());

        tree.set_service_uuid(1, S);
        tree.set_characteristic_uuid(2, C);
        assert!(tree.unresolved_services().is_empty());
        assert!(tree.unresolved_characteristics().is_empty());
        assert_eq!(tree.snapshot()[0].characteristics[0].uuid, C);
    }

    #[test]
    fn test_declaration_parsing() {
        assert_eq!(parse_service_declaration(&[0x0F, 0x18]), Some(S));
        assert_eq!(parse_characteristic_declaration(&[0x12, 0x0B, 0x00, 0x19, 0x2A]), Some(C));

        let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut le = *uuid.as_bytes();
        le.reverse();
        assert_eq!(parse_service_declaration(&le), Some(uuid));

        let mut declaration = vec![0x10, 0x0B, 0x00];
        declaration.extend_from_slice(&le);
        assert_eq!(parse_characteristic_declaration(&declaration), Some(uuid));

        assert_eq!(parse_service_declaration(&[0x01, 0x02, 0x03]), None);
        assert_eq!(parse_characteristic_declaration(&[0x10, 0x0B]), None);
    }
}
