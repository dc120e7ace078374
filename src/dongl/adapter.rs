//! Adapter for the dongle backend.
//!
//! The adapter owns the link and routes its events: advertisements by
//! address, connection events by address, everything else by connection
//! handle.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::api::{Adapter, EventHandler, Peripheral, PeripheralHandler, PeripheralRef};
use crate::callback::Callback;
use crate::commands::CommandHandler;
use crate::dongl::{DonglConfig, DonglPeripheral};
use crate::error::Result;
use crate::link::Link;
use crate::protocol::{AdvertisingReport, Event};
use crate::transport::Transport;
use crate::types::BluetoothAddress;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A dongle attached to one serial port.
pub struct DonglAdapter {
    commands: CommandHandler,
    config: DonglConfig,
    identifier: String,
    powered: AtomicBool,
    scanning: AtomicBool,
    peripherals: Mutex<BTreeMap<BluetoothAddress, Arc<DonglPeripheral>>>,
    seen: Mutex<BTreeSet<BluetoothAddress>>,
    on_power_on: Callback<()>,
    on_power_off: Callback<()>,
    on_scan_start: Callback<()>,
    on_scan_stop: Callback<()>,
    on_scan_found: Callback<PeripheralRef>,
    on_scan_updated: Callback<PeripheralRef>,
}

impl DonglAdapter {
    /// Opens the link over `transport` and initializes the dongle.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or the dongle
    /// rejects initialization.
    pub async fn open(transport: Box<dyn Transport>, config: DonglConfig) -> Result<Arc<Self>> {
        let link = Arc::new(Link::open(transport, config.exchange_timeout).await?);
        let adapter = Arc::new(Self {
            commands: CommandHandler::new(Arc::clone(&link)),
            config,
            identifier: format!("Dongl Adapter ({})", link.name()),
            powered: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            peripherals: Mutex::new(BTreeMap::new()),
            seen: Mutex::new(BTreeSet::new()),
            on_power_on: Callback::new(),
            on_power_off: Callback::new(),
            on_scan_start: Callback::new(),
            on_scan_stop: Callback::new(),
            on_scan_found: Callback::new(),
            on_scan_updated: Callback::new(),
        });

        let weak = Arc::downgrade(&adapter);
        link.set_event_callback(move |event| {
            if let Some(adapter) = weak.upgrade() {
                adapter.handle_event(event);
            }
        });

        adapter.commands.init().await?;
        tracing::info!("{} initialized", adapter.identifier);
        Ok(adapter)
    }

    /// Queries the dongle firmware identification string.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn firmware(&self) -> Result<String> {
        self.commands.whoami().await
    }

    /// Stops the link and closes the serial port.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn close(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        self.commands.link().close().await
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Advertisement(report) => self.handle_advertisement(&report),
            Event::Connected {
                conn_handle,
                address,
                ..
            } => {
                let peripheral = lock(&self.peripherals).get(&address).cloned();
                match peripheral {
                    Some(peripheral) => peripheral.handle_connected(conn_handle),
                    None => tracing::warn!(
                        "connection {} to unknown peripheral {}",
                        conn_handle,
                        address
                    ),
                }
            }
            Event::Disconnected {
                conn_handle,
                reason,
            } => {
                if let Some(peripheral) = self.by_conn_handle(conn_handle) {
                    peripheral.handle_disconnected(reason);
                }
            }
            Event::AttributeFound {
                conn_handle,
                records,
                is_last,
            } => {
                if let Some(peripheral) = self.by_conn_handle(conn_handle) {
                    peripheral.handle_attributes_found(records, is_last);
                }
            }
            Event::ValueChanged {
                conn_handle,
                handle,
                data,
            } => {
                if let Some(peripheral) = self.by_conn_handle(conn_handle) {
                    peripheral.handle_value_changed(handle, data);
                }
            }
        }
    }

    fn by_conn_handle(&self, conn_handle: u16) -> Option<Arc<DonglPeripheral>> {
        let found = lock(&self.peripherals)
            .values()
            .find(|p| p.conn_handle() == conn_handle)
            .cloned();
        if found.is_none() {
            tracing::debug!("event for unknown connection {}", conn_handle);
        }
        found
    }

    fn handle_advertisement(&self, report: &AdvertisingReport) {
        let data = report.parse();
        let peripheral = match lock(&self.peripherals).entry(report.address) {
            Entry::Occupied(entry) => {
                entry.get().update_advertising(report, data);
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                tracing::debug!("new peripheral {}", report.address);
                Arc::clone(entry.insert(Arc::new(DonglPeripheral::new(
                    self.commands.clone(),
                    self.config,
                    report,
                    data,
                ))))
            }
        };

        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        let first_sighting = lock(&self.seen).insert(report.address);
        if first_sighting {
            self.on_scan_found.call(peripheral);
        } else {
            self.on_scan_updated.call(peripheral);
        }
    }

    async fn scan_start_inner(&self) -> Result<()> {
        // Every start resets the seen set, even one that finds the scan running.
        lock(&self.seen).clear();
        if self.scanning.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.commands.scan_start().await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::debug!("{}: scan started", self.identifier);
        self.on_scan_start.call(());
        Ok(())
    }

    async fn scan_stop_inner(&self) -> Result<()> {
        if !self.scanning.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.commands.scan_stop().await?;
        self.scanning.store(false, Ordering::SeqCst);
        tracing::debug!("{}: scan stopped", self.identifier);
        self.on_scan_stop.call(());
        Ok(())
    }

    async fn scan_for_inner(&self, timeout: Duration) -> Result<()> {
        self.scan_start_inner().await?;
        tokio::time::sleep(timeout).await;
        self.scan_stop_inner().await
    }

    fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
        if powered {
            self.on_power_on.call(());
        } else {
            self.on_power_off.call(());
        }
    }

    fn peripherals_where(&self, keep: impl Fn(&DonglPeripheral) -> bool) -> Vec<PeripheralRef> {
        lock(&self.peripherals)
            .values()
            .filter(|p| keep(p))
            .map(|p| Arc::clone(p) as PeripheralRef)
            .collect()
    }
}

impl Adapter for DonglAdapter {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    /// The dongle does not report its own address.
    fn address(&self) -> BluetoothAddress {
        BluetoothAddress::default()
    }

    fn bluetooth_enabled(&self) -> bool {
        true
    }

    fn power_on(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.set_powered(true);
            Ok(())
        })
    }

    fn power_off(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.set_powered(false);
            Ok(())
        })
    }

    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn set_callback_on_power_on(&self, on_power_on: EventHandler) {
        self.on_power_on.load(move |()| on_power_on());
    }

    fn set_callback_on_power_off(&self, on_power_off: EventHandler) {
        self.on_power_off.load(move |()| on_power_off());
    }

    fn scan_start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.scan_start_inner())
    }

    fn scan_stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.scan_stop_inner())
    }

    fn scan_for(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.scan_for_inner(timeout))
    }

    fn scan_is_active(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn scan_get_results(&self) -> Vec<PeripheralRef> {
        let seen = lock(&self.seen).clone();
        self.peripherals_where(|p| seen.contains(&p.address()))
    }

    fn set_callback_on_scan_start(&self, on_scan_start: EventHandler) {
        self.on_scan_start.load(move |()| on_scan_start());
    }

    fn set_callback_on_scan_stop(&self, on_scan_stop: EventHandler) {
        self.on_scan_stop.load(move |()| on_scan_stop());
    }

    fn set_callback_on_scan_found(&self, on_scan_found: PeripheralHandler) {
        self.on_scan_found.load(on_scan_found);
    }

    fn set_callback_on_scan_updated(&self, on_scan_updated: PeripheralHandler) {
        self.on_scan_updated.load(on_scan_updated);
    }

    fn get_paired_peripherals(&self) -> BoxFuture<'_, Result<Vec<PeripheralRef>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn get_connected_peripherals(&self) -> BoxFuture<'_, Result<Vec<PeripheralRef>>> {
        let connected = self.peripherals_where(DonglPeripheral::is_connected);
        Box::pin(async move { Ok(connected) })
    }
}
