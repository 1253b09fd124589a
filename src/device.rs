//! Remote device.
//!
//! A [`Device`] is the application's handle on one peripheral: its
//! advertised properties, its connection and, once connected, its GATT
//! catalog and attribute I/O.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddr};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::{AttributeRef, Characteristic, GattCatalog, Service};
use crate::ble::connection::{
    ConnectionContext, ConnectionEvent, ConnectionManager, ConnectionState,
};
use crate::ble::io::{Listener, ListenerId};
use crate::ble::registry::DeviceFilter;
use crate::ble::uuids::{DEVICE_INFO_SERVICE_UUID, PNP_ID_UUID};
use crate::error::{Error, Result};

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Everything known about a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceProperties {
    /// Device address.
    pub address: BdAddr,
    /// Address type.
    pub address_type: AddressType,
    /// Identifier of the adapter the device was seen on.
    pub adapter: String,
    /// Remote name.
    pub name: Option<String>,
    /// Local alias set by the user.
    pub alias: Option<String>,
    /// Class of device.
    pub class: Option<u32>,
    /// GAP appearance.
    pub appearance: Option<u16>,
    /// Last received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised TX power in dBm.
    pub tx_power: Option<i16>,
    /// Bonded with the local adapter.
    pub paired: bool,
    /// Trusted by the user.
    pub trusted: bool,
    /// Blocked by the user; connections are refused.
    pub blocked: bool,
    /// Requires legacy (pre-4.2) pairing.
    pub legacy_pairing: bool,
    /// A link is up.
    pub connected: bool,
    /// Advertised (or resolved) service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Device ID modalias, once read from the PnP ID characteristic.
    pub modalias: Option<String>,
    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// When the device was first seen.
    pub first_seen: DateTime<Utc>,
    /// When the device was last seen.
    pub last_seen: DateTime<Utc>,
}

impl DeviceProperties {
    /// Properties of a device nothing is known about yet.
    pub fn new(address: BdAddr, address_type: AddressType, adapter: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            address,
            address_type,
            adapter: adapter.into(),
            name: None,
            alias: None,
            class: None,
            appearance: None,
            rssi: None,
            tx_power: None,
            paired: false,
            trusted: false,
            blocked: false,
            legacy_pairing: false,
            connected: false,
            service_uuids: Vec::new(),
            modalias: None,
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Display name: the alias, else the remote name, else the address
    /// with dashes.
    pub fn alias(&self) -> String {
        self.alias
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.address.dashed())
    }

    /// Freedesktop icon name derived from the appearance category.
    pub fn icon(&self) -> Option<&'static str> {
        let appearance = self.appearance?;
        let icon = match appearance >> 6 {
            0x01 => "phone",
            0x02 => "computer",
            0x05 => "video-display",
            0x0a => "multimedia-player",
            0x0b => "scanner",
            0x0f => match appearance & 0x3f {
                0x01 => "input-keyboard",
                0x02 => "input-mouse",
                0x03 | 0x04 => "input-gaming",
                0x05 => "input-tablet",
                0x08 => "scanner",
                _ => return None,
            },
            _ => return None,
        };
        Some(icon)
    }

    /// Whether the device matches a registry filter.
    pub fn matches(&self, filter: &DeviceFilter) -> bool {
        filter.matches(self)
    }

    /// Fold an advertisement in. Fields it carries replace what was known;
    /// absent fields are left alone.
    pub(crate) fn merge(&mut self, adv: &Advertisement) {
        self.address_type = adv.address_type;
        if let Some(name) = adv.name.as_ref().filter(|n| !n.is_empty()) {
            self.name = Some(name.clone());
        }
        if adv.rssi.is_some() {
            self.rssi = adv.rssi;
        }
        if adv.tx_power.is_some() {
            self.tx_power = adv.tx_power;
        }
        if adv.appearance.is_some() {
            self.appearance = adv.appearance;
        }
        if adv.class.is_some() {
            self.class = adv.class;
        }
        if !adv.service_uuids.is_empty() {
            self.service_uuids = adv.service_uuids.clone();
        }
        for (company, data) in &adv.manufacturer_data {
            self.manufacturer_data.insert(*company, data.clone());
        }
        for (uuid, data) in &adv.service_data {
            self.service_data.insert(*uuid, data.clone());
        }
        self.last_seen = Utc::now();
    }
}

/// A remote peripheral.
pub struct Device {
    /// Device address.
    address: BdAddr,
    /// Properties shared with the connection manager.
    properties: Arc<RwLock<DeviceProperties>>,
    /// Connection manager.
    connection: Arc<ConnectionManager>,
    /// Monotonic last-seen time used for ageing.
    last_seen: RwLock<Instant>,
    /// Channel for property updates.
    update_tx: broadcast::Sender<DeviceProperties>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl Device {
    pub(crate) fn new(
        address: BdAddr,
        address_type: AddressType,
        ctx: Arc<ConnectionContext>,
    ) -> Self {
        let properties = Arc::new(RwLock::new(DeviceProperties::new(
            address,
            address_type,
            ctx.adapter_id.clone(),
        )));
        let (update_tx, _) = broadcast::channel(ctx.config.event_capacity);
        let connection = ConnectionManager::new(ctx, address, properties.clone());

        Self {
            address,
            properties,
            connection,
            last_seen: RwLock::new(Instant::now()),
            update_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Update from an advertisement.
    pub(crate) fn update_from_advertisement(&self, adv: &Advertisement) {
        let snapshot = {
            let mut properties = self.properties.write();
            properties.merge(adv);
            properties.clone()
        };
        *self.last_seen.write() = Instant::now();
        let _ = self.update_tx.send(snapshot);
    }

    // === Identification ===

    /// Device address.
    pub fn address(&self) -> BdAddr {
        self.address
    }

    /// Address type.
    pub fn address_type(&self) -> AddressType {
        self.properties.read().address_type
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> DeviceProperties {
        self.properties.read().clone()
    }

    /// Remote name.
    pub fn name(&self) -> Option<String> {
        self.properties.read().name.clone()
    }

    /// Display name; see [`DeviceProperties::alias`].
    pub fn alias(&self) -> String {
        self.properties.read().alias()
    }

    /// Set or clear the local alias.
    pub fn set_alias(&self, alias: Option<String>) {
        self.properties.write().alias = alias.filter(|a| !a.is_empty());
    }

    /// Last received signal strength.
    pub fn rssi(&self) -> Option<i16> {
        self.properties.read().rssi
    }

    /// Advertised TX power.
    pub fn tx_power(&self) -> Option<i16> {
        self.properties.read().tx_power
    }

    /// GAP appearance.
    pub fn appearance(&self) -> Option<u16> {
        self.properties.read().appearance
    }

    /// Class of device.
    pub fn class(&self) -> Option<u32> {
        self.properties.read().class
    }

    /// Icon name derived from the appearance.
    pub fn icon(&self) -> Option<&'static str> {
        self.properties.read().icon()
    }

    /// Advertised service UUIDs.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.properties.read().service_uuids.clone()
    }

    /// Manufacturer data keyed by company identifier.
    pub fn manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        self.properties.read().manufacturer_data.clone()
    }

    /// Service data keyed by service UUID.
    pub fn service_data(&self) -> HashMap<Uuid, Vec<u8>> {
        self.properties.read().service_data.clone()
    }

    /// Modalias, once read with [`Device::read_modalias`].
    pub fn modalias(&self) -> Option<String> {
        self.properties.read().modalias.clone()
    }

    /// Identifier of the adapter the device was seen on.
    pub fn adapter(&self) -> String {
        self.properties.read().adapter.clone()
    }

    /// Bonded with the local adapter.
    pub fn is_paired(&self) -> bool {
        self.properties.read().paired
    }

    /// Trusted by the user.
    pub fn is_trusted(&self) -> bool {
        self.properties.read().trusted
    }

    /// Mark trusted or untrusted.
    pub fn set_trusted(&self, trusted: bool) {
        self.properties.write().trusted = trusted;
    }

    /// Blocked by the user.
    pub fn is_blocked(&self) -> bool {
        self.properties.read().blocked
    }

    /// Block or unblock. Blocking does not drop an existing link.
    pub fn set_blocked(&self, blocked: bool) {
        self.properties.write().blocked = blocked;
    }

    /// Requires legacy pairing.
    pub fn is_legacy_pairing(&self) -> bool {
        self.properties.read().legacy_pairing
    }

    /// When the device was first seen.
    pub fn first_seen(&self) -> DateTime<Utc> {
        self.properties.read().first_seen
    }

    /// When the device was last seen.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.properties.read().last_seen
    }

    /// Check if nothing was heard from the device within `ttl`.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.read().elapsed() > ttl
    }

    /// Subscribe to property updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<DeviceProperties> {
        self.update_tx.subscribe()
    }

    /// Register a callback for property updates.
    pub fn on_properties_updated<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DeviceProperties) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(update) = rx.recv().await {
                callback(&update);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Connection ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connect and resolve services; see [`ConnectionManager::connect_with_timeout`].
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Connect with an explicit link deadline.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection.connect_with_timeout(timeout).await
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Subscribe to connection events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.connection.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let ConnectionEvent::StateChanged { state, .. } = event {
                    callback(state);
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Run a pairing exchange.
    pub async fn pair(&self) -> Result<()> {
        self.connection.pair().await
    }

    /// Abort an outstanding pairing exchange.
    pub async fn cancel_pairing(&self) -> Result<()> {
        self.connection.cancel_pairing().await
    }

    /// Connect a profile on top of the link.
    pub fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        self.connection.connect_profile(uuid)
    }

    /// Disconnect a profile; the link stays up.
    pub fn disconnect_profile(&self, uuid: Uuid) -> Result<()> {
        self.connection.disconnect_profile(uuid)
    }

    /// Profiles currently connected.
    pub fn connected_profiles(&self) -> Vec<Uuid> {
        self.connection.connected_profiles()
    }

    // === GATT ===

    /// The catalog of the current connection.
    pub fn catalog(&self) -> Result<Arc<GattCatalog>> {
        self.connection.catalog()
    }

    /// All services in discovery order.
    pub fn services(&self) -> Result<Vec<Service>> {
        Ok(self.catalog()?.services().to_vec())
    }

    /// First service with the given UUID.
    pub fn service(&self, uuid: &Uuid) -> Result<Service> {
        self.catalog()?
            .service(uuid)
            .ok_or_else(|| Error::not_found(format!("service {} on {}", uuid, self.address)))
    }

    /// First characteristic with the given UUID inside the first service
    /// with UUID `service`.
    pub fn characteristic(&self, service: &Uuid, uuid: &Uuid) -> Result<Characteristic> {
        self.service(service)?.characteristic(uuid).ok_or_else(|| {
            Error::not_found(format!("characteristic {} in service {}", uuid, service))
        })
    }

    /// First characteristic with the given UUID in any service.
    pub fn find_characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.catalog()?
            .characteristic(None, uuid)
            .ok_or_else(|| Error::not_found(format!("characteristic {} on {}", uuid, self.address)))
    }

    /// Read a characteristic or descriptor with the configured timeout.
    pub async fn read<'a>(&self, attribute: impl Into<AttributeRef<'a>>) -> Result<Vec<u8>> {
        let timeout = self.connection.config().io_timeout;
        self.read_with_timeout(attribute, timeout).await
    }

    /// Read a characteristic or descriptor.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without a resolved connection
    /// - [`Error::NotFound`] for attributes of an earlier connection
    /// - [`Error::NotPermitted`] when the characteristic is not readable
    /// - [`Error::Timeout`] when the peer does not answer in time
    pub async fn read_with_timeout<'a>(
        &self,
        attribute: impl Into<AttributeRef<'a>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let session = self.connection.ready_session()?;
        session.io.read(attribute.into(), timeout).await
    }

    /// Write a characteristic or descriptor with the configured timeout.
    pub async fn write<'a>(
        &self,
        attribute: impl Into<AttributeRef<'a>>,
        value: &[u8],
    ) -> Result<()> {
        let timeout = self.connection.config().io_timeout;
        self.write_with_timeout(attribute, value, timeout).await
    }

    /// Write a characteristic or descriptor.
    ///
    /// Acknowledged when the characteristic supports it.
    pub async fn write_with_timeout<'a>(
        &self,
        attribute: impl Into<AttributeRef<'a>>,
        value: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let session = self.connection.ready_session()?;
        session.io.write(attribute.into(), value, timeout).await
    }

    /// Write a characteristic without acknowledgment.
    pub async fn write_without_response(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<()> {
        let session = self.connection.ready_session()?;
        let timeout = self.connection.config().io_timeout;
        session
            .io
            .write_without_response(characteristic, value, timeout)
            .await
    }

    /// Register a listener for notifications or indications.
    ///
    /// Listeners run on a delivery task, one value at a time, in arrival
    /// order.
    pub async fn subscribe<F>(
        &self,
        characteristic: &Characteristic,
        listener: F,
    ) -> Result<ListenerId>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let session = self.connection.ready_session()?;
        let timeout = self.connection.config().io_timeout;
        session.io.subscribe(characteristic, listener, timeout).await
    }

    /// Register a listener that forwards values into a channel.
    pub async fn subscribe_channel(
        &self,
        characteristic: &Characteristic,
    ) -> Result<(ListenerId, mpsc::UnboundedReceiver<Bytes>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(characteristic, move |value| {
                let _ = tx.send(value);
            })
            .await?;
        Ok((id, rx))
    }

    /// Remove a listener. Unknown listeners are ignored.
    pub async fn unsubscribe(&self, characteristic: &Characteristic, id: ListenerId) -> Result<()> {
        let session = match self.connection.ready_session() {
            Ok(session) => session,
            Err(_) => return Ok(()),
        };
        let timeout = self.connection.config().io_timeout;
        session.io.unsubscribe(characteristic, id, timeout).await
    }

    /// Read the Device Information PnP ID and record the modalias.
    ///
    /// Returns `None` when the device does not expose a PnP ID.
    pub async fn read_modalias(&self) -> Result<Option<String>> {
        let characteristic = match self.characteristic(&DEVICE_INFO_SERVICE_UUID, &PNP_ID_UUID) {
            Ok(c) => c,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let value = self.read(&characteristic).await?;
        let modalias = modalias_from_pnp_id(&value)?;
        debug!("{}: modalias {}", self.address, modalias);
        self.properties.write().modalias = Some(modalias.clone());
        Ok(Some(modalias))
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("name", &self.name())
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Format a PnP ID value (source, vendor, product, version; little endian)
/// as a modalias string.
fn modalias_from_pnp_id(value: &[u8]) -> Result<String> {
    if value.len() < 7 {
        return Err(Error::InvalidData {
            context: format!("PnP ID of {} bytes", value.len()),
        });
    }

    let vendor = u16::from_le_bytes([value[1], value[2]]);
    let product = u16::from_le_bytes([value[3], value[4]]);
    let version = u16::from_le_bytes([value[5], value[6]]);
    let source = match value[0] {
        0x01 => "bluetooth",
        0x02 => "usb",
        other => {
            return Err(Error::InvalidData {
                context: format!("PnP ID vendor source {:#04x}", other),
            })
        }
    };

    Ok(format!(
        "{}:v{:04X}p{:04X}d{:04X}",
        source, vendor, product, version
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::catalog::CharacteristicProperties;
    use crate::config::EngineConfig;
    use crate::transport::{FakeCharacteristic, FakePeripheral, FakeService, FakeTransport};
    use pretty_assertions::assert_eq;

    const ADDR: BdAddr = BdAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const SVC: Uuid = Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);

    fn device(transport: Arc<FakeTransport>) -> Device {
        let ctx = ConnectionContext::new(transport, EngineConfig::default(), "fake0".to_string());
        Device::new(ADDR, AddressType::Public, ctx)
    }

    #[test]
    fn test_alias_fallbacks() {
        let mut props = DeviceProperties::new(ADDR, AddressType::Public, "hci0");
        assert_eq!(props.alias(), "00-11-22-33-44-55");
        props.name = Some("SensorTag".to_string());
        assert_eq!(props.alias(), "SensorTag");
        props.alias = Some("Kitchen".to_string());
        assert_eq!(props.alias(), "Kitchen");
    }

    #[test]
    fn test_icon_from_appearance() {
        let mut props = DeviceProperties::new(ADDR, AddressType::Public, "hci0");
        assert_eq!(props.icon(), None);
        props.appearance = Some(0x03c1);
        assert_eq!(props.icon(), Some("input-keyboard"));
        props.appearance = Some(0x0040);
        assert_eq!(props.icon(), Some("phone"));
    }

    #[test]
    fn test_merge_replaces_present_fields_only() {
        let mut props = DeviceProperties::new(ADDR, AddressType::Public, "hci0");
        let first = Advertisement::new(ADDR, AddressType::Public)
            .with_name("SensorTag")
            .with_rssi(-40)
            .with_service_uuids([SVC]);
        props.merge(&first);

        let second = Advertisement::new(ADDR, AddressType::Public).with_rssi(-60);
        props.merge(&second);

        assert_eq!(props.name.as_deref(), Some("SensorTag"));
        assert_eq!(props.rssi, Some(-60));
        assert_eq!(props.service_uuids, vec![SVC]);
        assert!(props.last_seen >= props.first_seen);
    }

    #[test]
    fn test_modalias() {
        let value = [0x02, 0x6b, 0x1d, 0x46, 0x02, 0x37, 0x05];
        assert_eq!(modalias_from_pnp_id(&value).unwrap(), "usb:v1D6Bp0246d0537");
        assert!(modalias_from_pnp_id(&value[..3]).is_err());
        assert!(modalias_from_pnp_id(&[0x07, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_callback_handle_unregisters_on_drop() {
        use std::sync::atomic::AtomicBool;
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let handle = CallbackHandle::new(3, move || f.store(true, Ordering::SeqCst));
        assert_eq!(handle.id(), 3);
        drop(handle);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_io_requires_connection() {
        let transport = Arc::new(FakeTransport::new());
        let device = device(transport);

        assert_eq!(device.services().unwrap_err(), Error::NotConnected);
        assert!(device.find_characteristic(&SVC).is_err());
    }

    #[tokio::test]
    async fn test_blocked_device_refuses_connect() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(FakePeripheral::new(ADDR));
        let device = device(transport.clone());

        device.set_blocked(true);
        assert!(matches!(device.connect().await, Err(Error::NotSupported { .. })));
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_read_modalias() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(
            FakePeripheral::new(ADDR).with_service(
                FakeService::new(DEVICE_INFO_SERVICE_UUID).with_characteristic(
                    FakeCharacteristic::new(PNP_ID_UUID, CharacteristicProperties::READ)
                        .with_value(vec![0x01, 0x0d, 0x00, 0x00, 0x00, 0x10, 0x01]),
                ),
            ),
        );
        let device = device(transport);
        device.connect().await.unwrap();

        let modalias = device.read_modalias().await.unwrap();
        assert_eq!(modalias.as_deref(), Some("bluetooth:v000Dp0000d0110"));
        assert_eq!(device.modalias(), modalias);
    }

    #[tokio::test]
    async fn test_subscribe_channel_receives_notifications() {
        let transport = Arc::new(FakeTransport::new());
        let data = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);
        transport.add_peripheral(
            FakePeripheral::new(ADDR).with_service(
                FakeService::new(SVC).with_characteristic(FakeCharacteristic::new(
                    data,
                    CharacteristicProperties::NOTIFY,
                )),
            ),
        );
        let device = device(transport.clone());
        device.connect().await.unwrap();

        let characteristic = device.characteristic(&SVC, &data).unwrap();
        let (id, mut rx) = device.subscribe_channel(&characteristic).await.unwrap();

        // No event pump here; hand the value to the connection directly.
        let session = device.connection.ready_session().unwrap();
        device
            .connection
            .handle_value_changed(
                session.link,
                characteristic.handle(),
                Bytes::from_static(&[1, 2]),
            );

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[1, 2]));
        assert_eq!(characteristic.cached_value(), Some(vec![1, 2]));

        device.unsubscribe(&characteristic, id).await.unwrap();
        assert!(!characteristic.is_subscribed());
    }
}
