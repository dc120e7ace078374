//! Peripheral state machine for the dongle backend.
//!
//! Public calls run on the caller's task and wait on the [`Session`]
//! signal. The `handle_*` methods are driven by the adapter from the link's
//! I/O task, and are the only writers of connection and attribute state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::api::{EventHandler, Peripheral, ValueHandler};
use crate::callback::Callback;
use crate::commands::CommandHandler;
use crate::dongl::attributes::{
    AttributeTree, parse_characteristic_declaration, parse_service_declaration,
};
use crate::dongl::{
    CONN_HANDLE_INVALID, CONN_HANDLE_PENDING, ConnectionState, DonglConfig, Session,
};
use crate::error::{Error, Result};
use crate::protocol::{AdvertisingData, AdvertisingReport, AttributeRecord, WriteOperation};
use crate::signal::Signal;
use crate::types::{AddressType, BluetoothAddress, ByteArray, CharacteristicProperties, Service};

const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];
const CCCD_INDICATE: [u8; 2] = [0x02, 0x00];
const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Advertising state, refreshed on every sighting.
#[derive(Debug, Default)]
struct AdvertisingState {
    identifier: String,
    address_type: AddressType,
    rssi: i16,
    tx_power: i16,
    connectable: bool,
    manufacturer_data: BTreeMap<u16, ByteArray>,
    service_uuids: Vec<Uuid>,
    service_data: BTreeMap<Uuid, ByteArray>,
}

/// What a GATT operation needs from a characteristic definition.
#[derive(Debug, Clone, Copy)]
struct CharacteristicHandles {
    value: u16,
    cccd: Option<u16>,
    properties: CharacteristicProperties,
}

/// A peripheral reached through the dongle.
pub struct DonglPeripheral {
    commands: CommandHandler,
    config: DonglConfig,
    address: BluetoothAddress,
    session: Signal<Session>,
    advertising: Mutex<AdvertisingState>,
    attributes: Mutex<AttributeTree>,
    value_callbacks: Mutex<HashMap<u16, Arc<dyn Fn(ByteArray) + Send + Sync>>>,
    user_disconnect: AtomicBool,
    on_connected: Callback<()>,
    on_disconnected: Callback<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DonglPeripheral {
    /// Creates a peripheral from its first advertisement.
    #[must_use]
    pub fn new(
        commands: CommandHandler,
        config: DonglConfig,
        report: &AdvertisingReport,
        data: AdvertisingData,
    ) -> Self {
        let peripheral = Self {
            commands,
            config,
            address: report.address,
            session: Signal::new(Session::default()),
            advertising: Mutex::new(AdvertisingState::default()),
            attributes: Mutex::new(AttributeTree::new()),
            value_callbacks: Mutex::new(HashMap::new()),
            user_disconnect: AtomicBool::new(false),
            on_connected: Callback::new(),
            on_disconnected: Callback::new(),
        };
        peripheral.update_advertising(report, data);
        peripheral
    }

    /// Current connection handle.
    #[must_use]
    pub fn conn_handle(&self) -> u16 {
        self.session.get().conn_handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.session.get().state
    }

    /// Merges a new sighting into the advertising state.
    ///
    /// Manufacturer and service data are merged key by key; a newer value
    /// replaces an older one for the same key. An empty name never replaces
    /// a known one.
    pub fn update_advertising(&self, report: &AdvertisingReport, data: AdvertisingData) {
        let mut state = lock(&self.advertising);
        if let Some(identifier) = data.identifier.filter(|name| !name.is_empty()) {
            state.identifier = identifier;
        }
        state.address_type = report.address_type;
        state.rssi = i16::from(report.rssi);
        if let Some(tx_power) = data.tx_power {
            state.tx_power = i16::from(tx_power);
        }
        state.connectable = report.connectable;
        state.manufacturer_data.extend(data.manufacturer_data);
        for uuid in data.service_uuids {
            if !state.service_uuids.contains(&uuid) {
                state.service_uuids.push(uuid);
            }
        }
        state.service_data.extend(data.service_data);
    }

    /// Connection event for this peripheral's address.
    pub fn handle_connected(&self, conn_handle: u16) {
        tracing::info!("{} connected with handle {}", self.address, conn_handle);
        lock(&self.attributes).clear();
        self.session.modify(|session| {
            session.conn_handle = conn_handle;
            session.state = ConnectionState::Connected;
            session.discovered = false;
        });
    }

    /// Disconnection event for this peripheral's handle.
    pub fn handle_disconnected(&self, reason: u8) {
        let previous = self.session.get();
        tracing::info!(
            "{} disconnected (handle {}, reason 0x{:02x})",
            self.address,
            previous.conn_handle,
            reason
        );

        // User-requested disconnects report from `disconnect` instead. Read
        // the flag before waking the waiter that clears it.
        let unexpected = previous.state == ConnectionState::Ready
            && !self.user_disconnect.load(Ordering::SeqCst);

        lock(&self.attributes).clear();
        lock(&self.value_callbacks).clear();
        self.session.modify(|session| {
            session.conn_handle = CONN_HANDLE_INVALID;
            session.state = ConnectionState::Disconnected;
            session.discovered = false;
        });

        if unexpected {
            self.on_disconnected.call(());
        }
    }

    /// Attribute discovery batch for this peripheral's handle.
    pub fn handle_attributes_found(&self, records: Vec<AttributeRecord>, is_last: bool) {
        let done = {
            let mut attributes = lock(&self.attributes);
            attributes.ingest(records, is_last);
            attributes.is_complete()
        };
        self.session.modify(|session| {
            if session.state == ConnectionState::Connected {
                session.state = ConnectionState::Discovering;
            }
            session.discovered = done;
        });
    }

    /// Notification or indication for this peripheral's handle.
    pub fn handle_value_changed(&self, handle: u16, data: Bytes) {
        let callback = lock(&self.value_callbacks).get(&handle).cloned();
        match callback {
            Some(callback) => callback(data),
            None => tracing::trace!(
                "{}: value change on handle {} with no subscriber",
                self.address,
                handle
            ),
        }
    }

    /// Runs the connect retry loop.
    async fn connect_inner(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let attempts = self.config.max_connect_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            tracing::debug!("{}: connect attempt {}/{}", self.address, attempt, attempts);
            match self.attempt_connect().await {
                Ok(()) => {
                    self.resolve_uuids().await;
                    self.session.modify(|session| session.state = ConnectionState::Ready);
                    tracing::info!("{}: ready", self.address);
                    self.on_connected.call(());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("{}: attempt {} failed: {}", self.address, attempt, e);
                    self.session.modify(|session| {
                        if session.conn_handle == CONN_HANDLE_PENDING {
                            session.conn_handle = CONN_HANDLE_INVALID;
                        }
                        session.state = ConnectionState::Failed;
                    });
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        // The last attempt may have left a link up without usable attributes.
        self.release_stale_connection().await;
        self.forget_connection(ConnectionState::Failed);

        let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        tracing::warn!("{}: giving up after {} attempts: {}", self.address, attempts, reason);
        Err(Error::operation_failed(format!(
            "connection to {} failed after {} attempts: {}",
            self.address, attempts, reason
        )))
    }

    /// Asks the dongle to drop a live handle and waits for the confirmation.
    async fn release_stale_connection(&self) {
        let stale = self.session.get();
        if !stale.has_valid_handle() {
            return;
        }
        if let Err(e) = self.commands.disconnect(stale.conn_handle).await {
            tracing::debug!(
                "{}: disconnect of handle {} failed: {}",
                self.address,
                stale.conn_handle,
                e
            );
        }
        self.session
            .wait_for(self.config.disconnect_timeout, |s| {
                s.conn_handle == CONN_HANDLE_INVALID
            })
            .await;
    }

    /// Drops all per-connection state without talking to the dongle.
    fn forget_connection(&self, state: ConnectionState) {
        lock(&self.attributes).clear();
        lock(&self.value_callbacks).clear();
        self.session.set(Session {
            state,
            ..Session::default()
        });
    }

    async fn attempt_connect(&self) -> Result<()> {
        self.release_stale_connection().await;

        self.session.modify(|session| {
            session.conn_handle = CONN_HANDLE_PENDING;
            session.state = ConnectionState::Connecting;
            session.discovered = false;
        });
        let address_type = lock(&self.advertising).address_type;
        self.commands.connect(address_type, self.address).await?;

        let connected = self
            .session
            .wait_for(self.config.connect_timeout, Session::has_valid_handle)
            .await;
        if !connected {
            return Err(timeout("connect", self.config.connect_timeout));
        }

        let discovered = self
            .session
            .wait_for(self.config.discovery_timeout, |s| {
                s.discovered || !s.has_valid_handle()
            })
            .await;
        if !self.session.get().has_valid_handle() {
            return Err(Error::operation_failed("connection lost during discovery"));
        }
        if !discovered || lock(&self.attributes).is_empty() {
            return Err(timeout("attribute discovery", self.config.discovery_timeout));
        }
        Ok(())
    }

    /// Reads declarations for services and characteristics reported without
    /// a UUID.
    async fn resolve_uuids(&self) {
        let conn_handle = self.conn_handle();
        let (services, characteristics) = {
            let attributes = lock(&self.attributes);
            (
                attributes.unresolved_services(),
                attributes.unresolved_characteristics(),
            )
        };

        for start_handle in services {
            match self.commands.read(conn_handle, start_handle).await {
                Ok(value) => match parse_service_declaration(&value) {
                    Some(uuid) => lock(&self.attributes).set_service_uuid(start_handle, uuid),
                    None => tracing::warn!(
                        "{}: unexpected service declaration at {}: {}",
                        self.address,
                        start_handle,
                        hex::encode(&value)
                    ),
                },
                Err(e) => tracing::warn!(
                    "{}: failed to read service declaration at {}: {}",
                    self.address,
                    start_handle,
                    e
                ),
            }
        }

        for handle_decl in characteristics {
            match self.commands.read(conn_handle, handle_decl).await {
                Ok(value) => match parse_characteristic_declaration(&value) {
                    Some(uuid) => lock(&self.attributes).set_characteristic_uuid(handle_decl, uuid),
                    None => tracing::warn!(
                        "{}: unexpected characteristic declaration at {}: {}",
                        self.address,
                        handle_decl,
                        hex::encode(&value)
                    ),
                },
                Err(e) => tracing::warn!(
                    "{}: failed to read characteristic declaration at {}: {}",
                    self.address,
                    handle_decl,
                    e
                ),
            }
        }
    }

    async fn disconnect_inner(&self) -> Result<()> {
        let conn_handle = self.conn_handle();
        if conn_handle == CONN_HANDLE_INVALID || conn_handle == CONN_HANDLE_PENDING {
            return Ok(());
        }

        self.user_disconnect.store(true, Ordering::SeqCst);
        let result = self.disconnect_and_wait(conn_handle).await;
        self.user_disconnect.store(false, Ordering::SeqCst);
        result?;

        self.on_disconnected.call(());
        Ok(())
    }

    async fn disconnect_and_wait(&self, conn_handle: u16) -> Result<()> {
        self.commands
            .disconnect(conn_handle)
            .await
            .map_err(|e| Error::operation_failed(format!("failed to disconnect: {e}")))?;

        let confirmed = self
            .session
            .wait_for(self.config.disconnect_timeout, |s| {
                s.conn_handle == CONN_HANDLE_INVALID
            })
            .await;
        if confirmed {
            return Ok(());
        }

        // No confirmation; forget the connection anyway.
        self.forget_connection(ConnectionState::Disconnected);
        Err(Error::operation_failed(
            "timeout while waiting for disconnection confirmation",
        ))
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<CharacteristicHandles> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let attributes = lock(&self.attributes);
        let definition = attributes.find_characteristic(service, characteristic)?;
        Ok(CharacteristicHandles {
            value: definition.handle_value,
            cccd: definition.handle_cccd,
            properties: definition.properties,
        })
    }

    async fn read_inner(&self, service: Uuid, characteristic: Uuid) -> Result<ByteArray> {
        let handles = self.characteristic(service, characteristic)?;
        if !handles.properties.read {
            return Err(Error::operation_failed(format!(
                "characteristic {characteristic} is not readable"
            )));
        }
        self.commands
            .read(self.conn_handle(), handles.value)
            .await
            .map_err(|e| command_failed(e, "read", characteristic))
    }

    async fn write_inner(
        &self,
        service: Uuid,
        characteristic: Uuid,
        op: WriteOperation,
        data: ByteArray,
    ) -> Result<()> {
        let handles = self.characteristic(service, characteristic)?;
        let allowed = match op {
            WriteOperation::WriteRequest => handles.properties.write_request,
            WriteOperation::WriteCommand => handles.properties.write_command,
        };
        if !allowed {
            return Err(Error::operation_failed(format!(
                "characteristic {characteristic} is not writable"
            )));
        }
        self.commands
            .write(self.conn_handle(), handles.value, op, data)
            .await
            .map_err(|e| command_failed(e, "write", characteristic))
    }

    async fn subscribe_inner(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: ValueHandler,
        indicate: bool,
    ) -> Result<()> {
        let handles = self.characteristic(service, characteristic)?;
        let (allowed, value, kind) = if indicate {
            (handles.properties.indicate, &CCCD_INDICATE, "indicate")
        } else {
            (handles.properties.notify, &CCCD_NOTIFY, "notify")
        };
        if !allowed {
            return Err(Error::operation_failed(format!(
                "characteristic {characteristic} does not support {kind}"
            )));
        }
        let cccd = handles.cccd.ok_or_else(|| {
            Error::operation_failed(format!("characteristic {characteristic} has no CCCD"))
        })?;

        self.commands
            .write(
                self.conn_handle(),
                cccd,
                WriteOperation::WriteRequest,
                Bytes::from_static(value),
            )
            .await
            .map_err(|e| command_failed(e, kind, characteristic))?;

        lock(&self.value_callbacks).insert(handles.value, Arc::from(callback));
        Ok(())
    }

    async fn unsubscribe_inner(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let handles = self.characteristic(service, characteristic)?;
        let cccd = handles.cccd.ok_or_else(|| {
            Error::operation_failed(format!("characteristic {characteristic} has no CCCD"))
        })?;

        self.commands
            .write(
                self.conn_handle(),
                cccd,
                WriteOperation::WriteRequest,
                Bytes::from_static(&CCCD_DISABLE),
            )
            .await
            .map_err(|e| command_failed(e, "unsubscribe", characteristic))?;

        lock(&self.value_callbacks).remove(&handles.value);
        Ok(())
    }

    fn descriptor_unsupported(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        operation: &'static str,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        lock(&self.attributes).find_descriptor(service, characteristic, descriptor)?;
        Err(Error::NotSupported { operation })
    }
}

fn timeout(operation: &'static str, duration: std::time::Duration) -> Error {
    Error::Timeout {
        operation,
        timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Dongle rejections become `OperationFailed`; transport errors pass through.
fn command_failed(error: Error, operation: &str, characteristic: Uuid) -> Error {
    match error {
        Error::CommandFailed { ret_code, .. } => Error::operation_failed(format!(
            "failed to {operation} characteristic {characteristic}: return code {ret_code}"
        )),
        other => other,
    }
}

impl Peripheral for DonglPeripheral {
    fn identifier(&self) -> String {
        lock(&self.advertising).identifier.clone()
    }

    fn address(&self) -> BluetoothAddress {
        self.address
    }

    fn address_type(&self) -> AddressType {
        lock(&self.advertising).address_type
    }

    fn rssi(&self) -> i16 {
        lock(&self.advertising).rssi
    }

    fn tx_power(&self) -> i16 {
        lock(&self.advertising).tx_power
    }

    fn mtu(&self) -> u16 {
        0
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.connect_inner())
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.disconnect_inner())
    }

    fn is_connected(&self) -> bool {
        self.session.get().has_valid_handle()
    }

    fn is_connectable(&self) -> bool {
        lock(&self.advertising).connectable
    }

    fn is_paired(&self) -> bool {
        false
    }

    fn unpair(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn available_services(&self) -> Vec<Service> {
        lock(&self.attributes).snapshot()
    }

    fn advertised_services(&self) -> Vec<Service> {
        let state = lock(&self.advertising);
        let mut services: Vec<Service> = state
            .service_data
            .iter()
            .map(|(uuid, data)| Service::advertised(*uuid, data.clone()))
            .collect();
        for uuid in &state.service_uuids {
            if !state.service_data.contains_key(uuid) {
                services.push(Service::advertised(*uuid, ByteArray::new()));
            }
        }
        services
    }

    fn manufacturer_data(&self) -> BTreeMap<u16, ByteArray> {
        lock(&self.advertising).manufacturer_data.clone()
    }

    fn read(&self, service: Uuid, characteristic: Uuid) -> BoxFuture<'_, Result<ByteArray>> {
        Box::pin(self.read_inner(service, characteristic))
    }

    fn write_request(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: ByteArray,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_inner(service, characteristic, WriteOperation::WriteRequest, data))
    }

    fn write_command(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: ByteArray,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_inner(service, characteristic, WriteOperation::WriteCommand, data))
    }

    fn notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: ValueHandler,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.subscribe_inner(service, characteristic, callback, false))
    }

    fn indicate(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: ValueHandler,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.subscribe_inner(service, characteristic, callback, true))
    }

    fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.unsubscribe_inner(service, characteristic))
    }

    fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> BoxFuture<'_, Result<ByteArray>> {
        let result =
            self.descriptor_unsupported(service, characteristic, descriptor, "descriptor read");
        Box::pin(async move { result.map(|()| ByteArray::new()) })
    }

    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        _data: ByteArray,
    ) -> BoxFuture<'_, Result<()>> {
        let result =
            self.descriptor_unsupported(service, characteristic, descriptor, "descriptor write");
        Box::pin(async move { result })
    }

    fn set_callback_on_connected(&self, on_connected: EventHandler) {
        self.on_connected.load(move |()| on_connected());
    }

    fn set_callback_on_disconnected(&self, on_disconnected: EventHandler) {
        self.on_disconnected.load(move |()| on_disconnected());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::dongl::{
        DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCONNECT_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT,
        DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY,
    };
    use crate::link::Link;
    use crate::protocol::{Command, Event, FrameDecoder, Message, Response, encode_frame};
    use crate::transport::StreamTransport;
    use crate::types::{CCCD_UUID, uuid_from_u16};

    const SERVICE: Uuid = uuid_from_u16(0x180F);
    const LEVEL: Uuid = uuid_from_u16(0x2A19);
    const CONN: u16 = 0x0001;
    // Longer than any gap between commands, including a discovery timeout.
    const EXPECT_TIMEOUT: Duration = Duration::from_secs(30);

    fn address() -> BluetoothAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn report(data: &'static [u8]) -> AdvertisingReport {
        AdvertisingReport {
            address_type: AddressType::Public,
            address: address(),
            rssi: -60,
            connectable: true,
            data: Bytes::from_static(data),
        }
    }

    const LEVEL_VALUE: u16 = 4;
    const LEVEL_CCCD: u16 = 3;

    /// Battery service with a readable, notifiable level and its CCCD. The
    /// CCCD sits between the declaration and the value handle, where the
    /// attribute tree looks for descriptors.
    fn battery_records() -> Vec<AttributeRecord> {
        vec![
            AttributeRecord::Service {
                uuid: Some(SERVICE),
                start_handle: 1,
                end_handle: 4,
            },
            AttributeRecord::Characteristic {
                uuid: Some(LEVEL),
                handle_decl: 2,
                handle_value: LEVEL_VALUE,
                properties: CharacteristicProperties::from_bits(0x12),
            },
            AttributeRecord::Descriptor {
                uuid: Some(CCCD_UUID),
                handle: LEVEL_CCCD,
            },
        ]
    }

    fn route(peripheral: &DonglPeripheral, event: Event) {
        match event {
            Event::Connected { conn_handle, .. } => peripheral.handle_connected(conn_handle),
            Event::Disconnected { reason, .. } => peripheral.handle_disconnected(reason),
            Event::AttributeFound {
                records, is_last, ..
            } => peripheral.handle_attributes_found(records, is_last),
            Event::ValueChanged { handle, data, .. } => {
                peripheral.handle_value_changed(handle, data);
            }
            Event::Advertisement(_) => {}
        }
    }

    struct Harness {
        peripheral: Arc<DonglPeripheral>,
        remote: DuplexStream,
    }

    impl Harness {
        async fn new(config: DonglConfig) -> Self {
            let (local, remote) = tokio::io::duplex(4096);
            let transport = StreamTransport::new("test", local);
            let link = Arc::new(
                Link::open(Box::new(transport), config.exchange_timeout)
                    .await
                    .unwrap(),
            );
            let sighting = report(&[0x05, 0x09, b'T', b'e', b's', b't']);
            let peripheral = Arc::new(DonglPeripheral::new(
                CommandHandler::new(Arc::clone(&link)),
                config,
                &sighting,
                sighting.parse(),
            ));
            let weak = Arc::downgrade(&peripheral);
            link.set_event_callback(move |event| {
                if let Some(peripheral) = weak.upgrade() {
                    route(&peripheral, event);
                }
            });
            Self { peripheral, remote }
        }

        async fn expect(&mut self, command: Command) {
            let mut decoder = FrameDecoder::new();
            let mut byte = [0u8; 1];
            let read = async {
                loop {
                    self.remote.read_exact(&mut byte).await.unwrap();
                    if let Some(result) = decoder.push(byte[0]) {
                        break result.unwrap();
                    }
                }
            };
            let payload = tokio::time::timeout(EXPECT_TIMEOUT, read)
                .await
                .unwrap_or_else(|_| panic!("dongle never received {command:?}"));
            assert_eq!(payload, command.encode());
        }

        async fn send(&mut self, message: Message) {
            let frame = encode_frame(&message.encode()).unwrap();
            self.remote.write_all(&frame).await.unwrap();
        }

        /// Accepts a connect command and reports the link as up.
        async fn accept_connect(&mut self) {
            self.expect(Command::Connect {
                address_type: AddressType::Public,
                address: address(),
            })
            .await;
            self.send(Message::Response(Response::Connect { ret_code: 0 }))
                .await;
            self.send(Message::Event(Event::Connected {
                conn_handle: CONN,
                address_type: AddressType::Public,
                address: address(),
            }))
            .await;
        }

        /// Confirms a disconnect command for the test handle.
        async fn confirm_disconnect(&mut self) {
            self.expect(Command::Disconnect { conn_handle: CONN }).await;
            self.send(Message::Response(Response::Disconnect { ret_code: 0 }))
                .await;
            self.send(Message::Event(Event::Disconnected {
                conn_handle: CONN,
                reason: 0x16,
            }))
            .await;
        }

        async fn serve_connect(&mut self, records: Vec<AttributeRecord>) {
            self.accept_connect().await;
            self.send(Message::Event(Event::AttributeFound {
                conn_handle: CONN,
                records,
                is_last: true,
            }))
            .await;
        }

        async fn connect(&mut self) {
            let peripheral = Arc::clone(&self.peripheral);
            let task = tokio::spawn(async move { peripheral.connect().await });
            self.serve_connect(battery_records()).await;
            task.await.unwrap().unwrap();
        }
    }

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        let handler: EventHandler = Box::new(move || {
            handle.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[tokio::test]
    async fn test_connect_discovers_services() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let (connected, handler) = counter();
        harness.peripheral.set_callback_on_connected(handler);

        harness.connect().await;

        let peripheral = &harness.peripheral;
        assert!(peripheral.is_connected());
        assert_eq!(peripheral.conn_handle(), CONN);
        assert_eq!(peripheral.connection_state(), ConnectionState::Ready);
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        let services = peripheral.available_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, SERVICE);
        assert_eq!(services[0].characteristics[0].uuid, LEVEL);
        assert!(services[0].characteristics[0].can_notify());
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;
        // Nothing is exchanged; the fake dongle would not answer.
        harness.peripheral.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_resolves_missing_uuids() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.connect().await });

        harness
            .serve_connect(vec![
                AttributeRecord::Service {
                    uuid: None,
                    start_handle: 1,
                    end_handle: 3,
                },
                AttributeRecord::Characteristic {
                    uuid: None,
                    handle_decl: 2,
                    handle_value: 3,
                    properties: CharacteristicProperties::from_bits(0x02),
                },
            ])
            .await;
        harness
            .expect(Command::Read {
                conn_handle: CONN,
                handle: 1,
            })
            .await;
        harness
            .send(Message::Response(Response::Read {
                ret_code: 0,
                data: Bytes::from_static(&[0x0F, 0x18]),
            }))
            .await;
        harness
            .expect(Command::Read {
                conn_handle: CONN,
                handle: 2,
            })
            .await;
        harness
            .send(Message::Response(Response::Read {
                ret_code: 0,
                data: Bytes::from_static(&[0x02, 0x03, 0x00, 0x19, 0x2A]),
            }))
            .await;

        task.await.unwrap().unwrap();
        let services = harness.peripheral.available_services();
        assert_eq!(services[0].uuid, SERVICE);
        assert_eq!(services[0].characteristics[0].uuid, LEVEL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_max_attempts() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.connect().await });

        let mut sent_at = Vec::new();
        for _ in 0..DEFAULT_MAX_CONNECT_ATTEMPTS {
            harness
                .expect(Command::Connect {
                    address_type: AddressType::Public,
                    address: address(),
                })
                .await;
            sent_at.push(tokio::time::Instant::now());
            // Accept the command but never report the connection.
            harness
                .send(Message::Response(Response::Connect { ret_code: 0 }))
                .await;
        }

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
        assert_eq!(sent_at.len(), 10);
        let period = DEFAULT_CONNECT_TIMEOUT + DEFAULT_RETRY_DELAY;
        for pair in sent_at.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= period);
            assert!(gap < period + Duration::from_millis(100));
        }

        let peripheral = &harness.peripheral;
        assert!(!peripheral.is_connected());
        assert_eq!(peripheral.conn_handle(), CONN_HANDLE_INVALID);
        assert_eq!(peripheral.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_after_rejection() {
        let config = DonglConfig::new().max_connect_attempts(2);
        let mut harness = Harness::new(config).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.connect().await });

        harness
            .expect(Command::Connect {
                address_type: AddressType::Public,
                address: address(),
            })
            .await;
        harness
            .send(Message::Response(Response::Connect { ret_code: 0x11 }))
            .await;
        harness.serve_connect(battery_records()).await;

        task.await.unwrap().unwrap();
        assert!(harness.peripheral.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_after_discovery_timeout() {
        let config = DonglConfig::new().max_connect_attempts(2);
        let mut harness = Harness::new(config).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            (peripheral.connect().await, start.elapsed())
        });

        // The link comes up but no attributes are ever reported.
        harness.accept_connect().await;
        // The next attempt first drops the stale link.
        harness.confirm_disconnect().await;
        harness.serve_connect(battery_records()).await;

        let (result, elapsed) = task.await.unwrap();
        result.unwrap();
        assert!(elapsed >= DEFAULT_DISCOVERY_TIMEOUT + DEFAULT_RETRY_DELAY);
        assert_eq!(harness.peripheral.connection_state(), ConnectionState::Ready);
        assert_eq!(harness.peripheral.available_services().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_link_drops_during_discovery() {
        let config = DonglConfig::new().max_connect_attempts(1);
        let mut harness = Harness::new(config).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            (peripheral.connect().await, start.elapsed())
        });

        harness.accept_connect().await;
        harness
            .send(Message::Event(Event::AttributeFound {
                conn_handle: CONN,
                records: battery_records(),
                is_last: false,
            }))
            .await;
        let session = &harness.peripheral.session;
        assert!(
            session
                .wait_for(Duration::from_secs(1), |s| {
                    s.state == ConnectionState::Discovering
                })
                .await
        );
        harness
            .send(Message::Event(Event::Disconnected {
                conn_handle: CONN,
                reason: 0x08,
            }))
            .await;

        let (result, elapsed) = task.await.unwrap();
        match result {
            Err(Error::OperationFailed { reason }) => {
                assert!(reason.contains("connection lost during discovery"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(elapsed < DEFAULT_DISCOVERY_TIMEOUT);
        assert!(!harness.peripheral.is_connected());
        assert!(harness.peripheral.available_services().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_releases_link() {
        let config = DonglConfig::new().max_connect_attempts(1);
        let mut harness = Harness::new(config).await;
        let (connected, handler) = counter();
        harness.peripheral.set_callback_on_connected(handler);
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.connect().await });

        // Connected, then silence until discovery times out.
        harness.accept_connect().await;
        harness.confirm_disconnect().await;

        match task.await.unwrap() {
            Err(Error::OperationFailed { reason }) => {
                assert!(reason.contains("attribute discovery"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let peripheral = &harness.peripheral;
        assert!(!peripheral.is_connected());
        assert_eq!(peripheral.conn_handle(), CONN_HANDLE_INVALID);
        assert_eq!(peripheral.connection_state(), ConnectionState::Failed);
        assert!(peripheral.available_services().is_empty());
        assert_eq!(connected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_forgets_unconfirmed_link() {
        let config = DonglConfig::new().max_connect_attempts(1);
        let mut harness = Harness::new(config).await;
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.connect().await });

        harness.accept_connect().await;
        harness
            .expect(Command::Disconnect { conn_handle: CONN })
            .await;
        harness
            .send(Message::Response(Response::Disconnect { ret_code: 0 }))
            .await;

        assert!(matches!(
            task.await.unwrap(),
            Err(Error::OperationFailed { .. })
        ));
        assert!(!harness.peripheral.is_connected());
        assert_eq!(harness.peripheral.conn_handle(), CONN_HANDLE_INVALID);
    }

    #[tokio::test]
    async fn test_user_disconnect_fires_callback_once() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let (disconnected, handler) = counter();
        harness.peripheral.set_callback_on_disconnected(handler);
        harness.connect().await;

        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.disconnect().await });
        harness
            .expect(Command::Disconnect { conn_handle: CONN })
            .await;
        harness
            .send(Message::Response(Response::Disconnect { ret_code: 0 }))
            .await;
        harness
            .send(Message::Event(Event::Disconnected {
                conn_handle: CONN,
                reason: 0x16,
            }))
            .await;

        task.await.unwrap().unwrap();
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert!(!harness.peripheral.is_connected());
        assert!(harness.peripheral.available_services().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_confirmation_fails() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let (disconnected, handler) = counter();
        harness.peripheral.set_callback_on_disconnected(handler);
        harness.connect().await;

        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            (peripheral.disconnect().await, start.elapsed())
        });
        harness
            .expect(Command::Disconnect { conn_handle: CONN })
            .await;
        harness
            .send(Message::Response(Response::Disconnect { ret_code: 0 }))
            .await;

        let (result, elapsed) = task.await.unwrap();
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
        assert!(elapsed >= DEFAULT_DISCONNECT_TIMEOUT);
        assert!(!harness.peripheral.is_connected());
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let harness = Harness::new(DonglConfig::default()).await;
        harness.peripheral.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_loss_fires_disconnected() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        let (disconnected, handler) = counter();
        harness.peripheral.set_callback_on_disconnected(handler);
        harness.connect().await;

        harness
            .send(Message::Event(Event::Disconnected {
                conn_handle: CONN,
                reason: 0x08,
            }))
            .await;
        let peripheral = Arc::clone(&harness.peripheral);
        assert!(
            peripheral
                .session
                .wait_for(Duration::from_secs(1), |s| !s.has_valid_handle())
                .await
        );

        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
        assert!(peripheral.available_services().is_empty());
    }

    #[tokio::test]
    async fn test_read_characteristic() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;

        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.read(SERVICE, LEVEL).await });
        harness
            .expect(Command::Read {
                conn_handle: CONN,
                handle: LEVEL_VALUE,
            })
            .await;
        harness
            .send(Message::Response(Response::Read {
                ret_code: 0,
                data: Bytes::from_static(&[0x64]),
            }))
            .await;

        assert_eq!(task.await.unwrap().unwrap().as_ref(), &[0x64]);
    }

    #[tokio::test]
    async fn test_read_rejected_by_dongle() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;

        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.read(SERVICE, LEVEL).await });
        harness
            .expect(Command::Read {
                conn_handle: CONN,
                handle: LEVEL_VALUE,
            })
            .await;
        harness
            .send(Message::Response(Response::Read {
                ret_code: 0x0A,
                data: Bytes::new(),
            }))
            .await;

        assert!(matches!(
            task.await.unwrap(),
            Err(Error::OperationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_notify_delivers_values() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move {
            peripheral
                .notify(
                    SERVICE,
                    LEVEL,
                    Box::new(move |value| {
                        let _ = tx.send(value);
                    }),
                )
                .await
        });
        harness
            .expect(Command::Write {
                conn_handle: CONN,
                handle: LEVEL_CCCD,
                op: WriteOperation::WriteRequest,
                data: Bytes::from_static(&CCCD_NOTIFY),
            })
            .await;
        harness
            .send(Message::Response(Response::Write { ret_code: 0 }))
            .await;
        task.await.unwrap().unwrap();

        harness
            .send(Message::Event(Event::ValueChanged {
                conn_handle: CONN,
                handle: LEVEL_VALUE,
                data: Bytes::from_static(&[0x42]),
            }))
            .await;
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x42]);

        let peripheral = Arc::clone(&harness.peripheral);
        let task = tokio::spawn(async move { peripheral.unsubscribe(SERVICE, LEVEL).await });
        harness
            .expect(Command::Write {
                conn_handle: CONN,
                handle: LEVEL_CCCD,
                op: WriteOperation::WriteRequest,
                data: Bytes::from_static(&CCCD_DISABLE),
            })
            .await;
        harness
            .send(Message::Response(Response::Write { ret_code: 0 }))
            .await;
        task.await.unwrap().unwrap();
        assert!(harness.peripheral.value_callbacks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_checked_before_sending() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;
        let peripheral = &harness.peripheral;

        let write = peripheral
            .write_request(SERVICE, LEVEL, Bytes::from_static(&[0x01]))
            .await;
        assert!(matches!(write, Err(Error::OperationFailed { .. })));

        let indicate = peripheral.indicate(SERVICE, LEVEL, Box::new(|_| {})).await;
        assert!(matches!(indicate, Err(Error::OperationFailed { .. })));

        let missing = peripheral.read(SERVICE, uuid_from_u16(0x2A00)).await;
        assert!(matches!(missing, Err(Error::CharacteristicNotFound { .. })));

        let missing = peripheral.read(uuid_from_u16(0x1800), LEVEL).await;
        assert!(matches!(missing, Err(Error::ServiceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_descriptor_access_not_supported() {
        let mut harness = Harness::new(DonglConfig::default()).await;
        harness.connect().await;
        let peripheral = &harness.peripheral;

        let read = peripheral.read_descriptor(SERVICE, LEVEL, CCCD_UUID).await;
        assert!(matches!(
            read,
            Err(Error::NotSupported {
                operation: "descriptor read"
            })
        ));

        let write = peripheral
            .write_descriptor(SERVICE, LEVEL, CCCD_UUID, Bytes::from_static(&[0x01, 0x00]))
            .await;
        assert!(matches!(write, Err(Error::NotSupported { .. })));

        let unknown = peripheral
            .read_descriptor(SERVICE, LEVEL, uuid_from_u16(0x2901))
            .await;
        assert!(matches!(unknown, Err(Error::DescriptorNotFound { .. })));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let harness = Harness::new(DonglConfig::default()).await;
        let peripheral = &harness.peripheral;

        assert!(matches!(
            peripheral.read(SERVICE, LEVEL).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            peripheral.read_descriptor(SERVICE, LEVEL, CCCD_UUID).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(peripheral.mtu(), 0);
        assert!(!peripheral.is_paired());
        peripheral.unpair().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertising_data_merges() {
        let harness = Harness::new(DonglConfig::default()).await;
        let peripheral = &harness.peripheral;
        assert_eq!(peripheral.identifier(), "Test");
        assert!(peripheral.is_connectable());

        // Manufacturer 0x0059 and service data for 0x180F, no name.
        let first = report(&[
            0x05, 0xFF, 0x59, 0x00, 0x01, 0x02, 0x04, 0x16, 0x0F, 0x18, 0x50,
        ]);
        peripheral.update_advertising(&first, first.parse());
        // Manufacturer 0x004C, TX power and a listed service.
        let second = report(&[
            0x04, 0xFF, 0x4C, 0x00, 0x07, 0x02, 0x0A, 0xF8, 0x03, 0x03, 0x0D, 0x18,
        ]);
        peripheral.update_advertising(&second, second.parse());

        assert_eq!(peripheral.identifier(), "Test");
        assert_eq!(peripheral.tx_power(), -8);
        assert_eq!(peripheral.rssi(), -60);

        let manufacturer = peripheral.manufacturer_data();
        assert_eq!(manufacturer.len(), 2);
        assert_eq!(manufacturer[&0x0059].as_ref(), &[0x01, 0x02]);
        assert_eq!(manufacturer[&0x004C].as_ref(), &[0x07]);

        let advertised = peripheral.advertised_services();
        assert_eq!(advertised.len(), 2);
        assert_eq!(advertised[0].uuid, SERVICE);
        assert_eq!(advertised[0].data.as_ref(), &[0x50]);
        assert_eq!(advertised[1].uuid, uuid_from_u16(0x180D));
        assert!(advertised[1].data.is_empty());
    }
}
