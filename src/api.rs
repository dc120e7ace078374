//! Backend-neutral adapter and peripheral interfaces.
//!
//! Every backend provides an [`Adapter`] and [`Peripheral`] implementation and
//! is selected up front through its [`Backend`]. Async methods return boxed
//! futures so the traits stay usable as trait objects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{AddressType, BluetoothAddress, ByteArray, Service};

/// Shared handle to a peripheral.
pub type PeripheralRef = Arc<dyn Peripheral>;

/// Shared handle to an adapter.
pub type AdapterRef = Arc<dyn Adapter>;

/// Callback without arguments.
pub type EventHandler = Box<dyn Fn() + Send + Sync>;

/// Callback receiving a peripheral.
pub type PeripheralHandler = Box<dyn Fn(PeripheralRef) + Send + Sync>;

/// Callback receiving a characteristic value.
pub type ValueHandler = Box<dyn Fn(ByteArray) + Send + Sync>;

/// A source of adapters.
pub trait Backend: Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// Returns true if Bluetooth is usable through this backend.
    fn bluetooth_enabled(&self) -> bool;

    /// Enumerates and opens the adapters this backend can reach.
    fn get_adapters(&self) -> BoxFuture<'_, Result<Vec<AdapterRef>>>;
}

/// A local Bluetooth adapter.
pub trait Adapter: Send + Sync {
    /// Adapter name.
    fn identifier(&self) -> String;

    /// Adapter address.
    fn address(&self) -> BluetoothAddress;

    /// Returns true if Bluetooth is enabled.
    fn bluetooth_enabled(&self) -> bool;

    /// Powers the adapter on.
    fn power_on(&self) -> BoxFuture<'_, Result<()>>;

    /// Powers the adapter off.
    fn power_off(&self) -> BoxFuture<'_, Result<()>>;

    /// Returns true if powered.
    fn is_powered(&self) -> bool;

    /// Called after the adapter powers on.
    fn set_callback_on_power_on(&self, on_power_on: EventHandler);

    /// Called after the adapter powers off.
    fn set_callback_on_power_off(&self, on_power_off: EventHandler);

    /// Starts scanning and forgets previously seen peripherals.
    fn scan_start(&self) -> BoxFuture<'_, Result<()>>;

    /// Stops scanning.
    fn scan_stop(&self) -> BoxFuture<'_, Result<()>>;

    /// Scans for `timeout`, then stops.
    fn scan_for(&self, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Returns true while scanning.
    fn scan_is_active(&self) -> bool;

    /// Peripherals seen since the last scan start.
    fn scan_get_results(&self) -> Vec<PeripheralRef>;

    /// Called when a scan starts.
    fn set_callback_on_scan_start(&self, on_scan_start: EventHandler);

    /// Called when a scan stops.
    fn set_callback_on_scan_stop(&self, on_scan_stop: EventHandler);

    /// Called on the first sighting of a peripheral during a scan.
    fn set_callback_on_scan_found(&self, on_scan_found: PeripheralHandler);

    /// Called on later sightings of a peripheral during a scan.
    fn set_callback_on_scan_updated(&self, on_scan_updated: PeripheralHandler);

    /// Peripherals bonded with this adapter.
    fn get_paired_peripherals(&self) -> BoxFuture<'_, Result<Vec<PeripheralRef>>>;

    /// Peripherals currently connected through this adapter.
    fn get_connected_peripherals(&self) -> BoxFuture<'_, Result<Vec<PeripheralRef>>>;
}

/// A remote BLE peripheral.
pub trait Peripheral: Send + Sync {
    /// Advertised name.
    fn identifier(&self) -> String;

    /// Device address.
    fn address(&self) -> BluetoothAddress;

    /// Device address type.
    fn address_type(&self) -> AddressType;

    /// Last received signal strength in dBm.
    fn rssi(&self) -> i16;

    /// Advertised TX power in dBm.
    fn tx_power(&self) -> i16;

    /// Negotiated ATT MTU, or 0 if unknown.
    fn mtu(&self) -> u16;

    /// Connects and discovers attributes.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Disconnects.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    /// Returns true while connected.
    fn is_connected(&self) -> bool;

    /// Returns true if the last advertisement was connectable.
    fn is_connectable(&self) -> bool;

    /// Returns true if bonded.
    fn is_paired(&self) -> bool;

    /// Removes the bond.
    fn unpair(&self) -> BoxFuture<'_, Result<()>>;

    /// Services discovered on connection.
    fn available_services(&self) -> Vec<Service>;

    /// Services listed in advertisements.
    fn advertised_services(&self) -> Vec<Service>;

    /// Manufacturer data keyed by company identifier.
    fn manufacturer_data(&self) -> BTreeMap<u16, ByteArray>;

    /// Reads a characteristic value.
    fn read(&self, service: Uuid, characteristic: Uuid) -> BoxFuture<'_, Result<ByteArray>>;

    /// Writes a characteristic value, with response.
    fn write_request(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: ByteArray,
    ) -> BoxFuture<'_, Result<()>>;

    /// Writes a characteristic value, without response.
    fn write_command(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: ByteArray,
    ) -> BoxFuture<'_, Result<()>>;

    /// Subscribes to notifications.
    fn notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: ValueHandler,
    ) -> BoxFuture<'_, Result<()>>;

    /// Subscribes to indications.
    fn indicate(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: ValueHandler,
    ) -> BoxFuture<'_, Result<()>>;

    /// Cancels a notification or indication subscription.
    fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> BoxFuture<'_, Result<()>>;

    /// Reads a descriptor value.
    fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> BoxFuture<'_, Result<ByteArray>>;

    /// Writes a descriptor value.
    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        data: ByteArray,
    ) -> BoxFuture<'_, Result<()>>;

    /// Called after a connection is established.
    fn set_callback_on_connected(&self, on_connected: EventHandler);

    /// Called after the connection is lost or closed.
    fn set_callback_on_disconnected(&self, on_disconnected: EventHandler);
}
