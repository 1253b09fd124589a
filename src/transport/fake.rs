//! In-memory transport simulating a set of peripherals.
//!
//! Used by the unit tests and, with the `fake-transport` feature, by the
//! demos when no radio is around. Delays and failures can be injected per
//! transport.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::{
    AdapterInfo, AttributeHandle, CharacteristicDefinition, DescriptorDefinition, LinkHandle,
    ServiceDefinition, Transport, TransportEvent, DEFAULT_MAX_ATTRIBUTE_LEN,
};
use crate::ble::address::{AddressType, BdAddr};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::CharacteristicProperties;
use crate::ble::scanner::DiscoveryFilter;
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID;
use crate::error::{Error, Result};

/// A simulated characteristic.
#[derive(Debug, Clone)]
pub struct FakeCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<(Uuid, Vec<u8>)>,
}

impl FakeCharacteristic {
    /// Create a characteristic. Notify/indicate capable characteristics get a
    /// client configuration descriptor automatically.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        let descriptors = if properties.can_subscribe() {
            vec![(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, vec![0, 0])]
        } else {
            Vec::new()
        };

        Self {
            uuid,
            properties,
            value: Vec::new(),
            descriptors,
        }
    }

    /// Set the initial value.
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Add a descriptor.
    pub fn with_descriptor(mut self, uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.descriptors.push((uuid, value.into()));
        self
    }

    /// Remove every descriptor, including the automatic CCCD.
    pub fn without_descriptors(mut self) -> Self {
        self.descriptors.clear();
        self
    }
}

/// A simulated service.
#[derive(Debug, Clone)]
pub struct FakeService {
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    /// Create a primary service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic.
    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    address: BdAddr,
    address_type: AddressType,
    name: Option<String>,
    rssi: Option<i16>,
    advertised: Vec<Uuid>,
    services: Vec<FakeService>,
}

impl FakePeripheral {
    /// Create a peripheral with a public address and no services.
    pub fn new(address: BdAddr) -> Self {
        Self {
            address,
            address_type: AddressType::Public,
            name: None,
            rssi: None,
            advertised: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the advertised signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add an advertised service UUID.
    pub fn advertising(mut self, uuid: Uuid) -> Self {
        self.advertised.push(uuid);
        self
    }

    /// Add a GATT service.
    pub fn with_service(mut self, service: FakeService) -> Self {
        self.services.push(service);
        self
    }

    fn advertisement(&self) -> Advertisement {
        let mut adv = Advertisement::new(self.address, self.address_type)
            .with_service_uuids(self.advertised.iter().copied());
        adv.name = self.name.clone();
        adv.rssi = self.rssi;
        adv
    }
}

/// Attribute table laid out the way a GATT server numbers its handles.
struct Table {
    services: Vec<ServiceDefinition>,
    characteristics: HashMap<AttributeHandle, Vec<CharacteristicDefinition>>,
    descriptors: HashMap<AttributeHandle, Vec<DescriptorDefinition>>,
    values: HashMap<AttributeHandle, Vec<u8>>,
}

impl Table {
    fn build(peripheral: &FakePeripheral) -> Self {
        let mut next = 1u16;
        let mut alloc = || {
            let handle = AttributeHandle(next);
            next += 1;
            handle
        };

        let mut table = Self {
            services: Vec::new(),
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
            values: HashMap::new(),
        };

        for service in &peripheral.services {
            let service_handle = alloc();
            table.services.push(ServiceDefinition {
                handle: service_handle,
                uuid: service.uuid,
                primary: service.primary,
            });

            let mut chars = Vec::new();
            for characteristic in &service.characteristics {
                // Declaration, then value.
                let _declaration = alloc();
                let value_handle = alloc();
                chars.push(CharacteristicDefinition {
                    handle: value_handle,
                    uuid: characteristic.uuid,
                    properties: characteristic.properties,
                });
                table.values.insert(value_handle, characteristic.value.clone());

                let mut descs = Vec::new();
                for (uuid, value) in &characteristic.descriptors {
                    let handle = alloc();
                    descs.push(DescriptorDefinition {
                        handle,
                        uuid: *uuid,
                    });
                    table.values.insert(handle, value.clone());
                }
                table.descriptors.insert(value_handle, descs);
            }
            table.characteristics.insert(service_handle, chars);
        }

        table
    }

    fn handle_of(&self, uuid: &Uuid) -> Option<AttributeHandle> {
        self.characteristics
            .values()
            .flatten()
            .filter(|c| c.uuid == *uuid)
            .map(|c| c.handle)
            .min()
    }
}

struct PeripheralEntry {
    peripheral: FakePeripheral,
    table: Table,
}

/// One recorded attribute write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target peripheral.
    pub address: BdAddr,
    /// Target attribute.
    pub attribute: AttributeHandle,
    /// Written bytes.
    pub value: Vec<u8>,
    /// Whether an acknowledgment was requested.
    pub ack_required: bool,
}

/// Callback run by the transport while it serves a request on a link.
pub type LinkHook = Arc<dyn Fn(LinkHandle) + Send + Sync>;

#[derive(Default)]
struct Knobs {
    connect_error: Option<String>,
    connect_delay: Duration,
    discovery_delay: Duration,
    fail_descriptor_discovery: bool,
    read_delay: Duration,
    ack_delay: Duration,
    pair_delay: Duration,
    max_attribute_len: Option<usize>,
    discovery_hook: Option<LinkHook>,
    write_hook: Option<LinkHook>,
}

#[derive(Default)]
struct State {
    peripherals: HashMap<BdAddr, PeripheralEntry>,
    links: HashMap<LinkHandle, BdAddr>,
    next_link: u64,
    scanning: bool,
    scan_starts: usize,
    connect_calls: usize,
    writes: Vec<RecordedWrite>,
    pairings: usize,
    knobs: Knobs,
}

/// In-memory [`Transport`].
pub struct FakeTransport {
    state: Mutex<State>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Create a transport with no peripherals.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            event_tx,
        }
    }

    /// Register a peripheral. It is reachable for connections immediately
    /// but only shows up in the registry once it advertises.
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        let table = Table::build(&peripheral);
        self.state
            .lock()
            .peripherals
            .insert(peripheral.address, PeripheralEntry { peripheral, table });
    }

    /// Emit an advertisement for a registered peripheral.
    pub fn advertise(&self, address: BdAddr) -> bool {
        let adv = match self.state.lock().peripherals.get(&address) {
            Some(entry) => entry.peripheral.advertisement(),
            None => return false,
        };
        self.emit(TransportEvent::AdvertisementSeen(adv));
        true
    }

    /// Emit an arbitrary event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Push a notification for the first characteristic with `uuid` on the
    /// peripheral's active link. Returns `false` when there is no link.
    pub fn notify(&self, address: BdAddr, uuid: &Uuid, value: impl Into<Bytes>) -> bool {
        let (link, attribute) = {
            let state = self.state.lock();
            let link = state
                .links
                .iter()
                .find(|(_, a)| **a == address)
                .map(|(l, _)| *l);
            let attribute = state
                .peripherals
                .get(&address)
                .and_then(|e| e.table.handle_of(uuid));
            match (link, attribute) {
                (Some(link), Some(attribute)) => (link, attribute),
                _ => return false,
            }
        };

        self.emit(TransportEvent::ValueChanged {
            link,
            attribute,
            value: value.into(),
        });
        true
    }

    /// Drop the peripheral's link as if the peer went away.
    pub fn drop_link(&self, address: BdAddr, reason: &str) -> bool {
        let link = {
            let mut state = self.state.lock();
            let link = state
                .links
                .iter()
                .find(|(_, a)| **a == address)
                .map(|(l, _)| *l);
            if let Some(link) = link {
                state.links.remove(&link);
            }
            link
        };

        match link {
            Some(link) => {
                self.emit(TransportEvent::LinkLost {
                    link,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Replace the stored value of the first characteristic with `uuid`.
    pub fn set_value(&self, address: BdAddr, uuid: &Uuid, value: impl Into<Vec<u8>>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.peripherals.get_mut(&address) {
            if let Some(handle) = entry.table.handle_of(uuid) {
                entry.table.values.insert(handle, value.into());
            }
        }
    }

    /// Writes issued so far, oldest first.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of `link_connect` calls so far.
    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    /// Number of `scan_start` calls that reached the radio.
    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    /// Whether the peripheral currently has a link.
    pub fn is_linked(&self, address: BdAddr) -> bool {
        self.state.lock().links.values().any(|a| *a == address)
    }

    /// Number of completed pairing exchanges.
    pub fn pairings(&self) -> usize {
        self.state.lock().pairings
    }

    /// Make `link_connect` fail with a transport error.
    pub fn set_connect_error(&self, reason: Option<&str>) {
        self.state.lock().knobs.connect_error = reason.map(str::to_string);
    }

    /// Delay `link_connect`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().knobs.connect_delay = delay;
    }

    /// Delay `discover_services`.
    pub fn set_discovery_delay(&self, delay: Duration) {
        self.state.lock().knobs.discovery_delay = delay;
    }

    /// Make `discover_descriptors` fail.
    pub fn fail_descriptor_discovery(&self, fail: bool) {
        self.state.lock().knobs.fail_descriptor_discovery = fail;
    }

    /// Delay every read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().knobs.read_delay = delay;
    }

    /// Delay the acknowledgment of acknowledged writes.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state.lock().knobs.ack_delay = delay;
    }

    /// Delay pairing exchanges.
    pub fn set_pair_delay(&self, delay: Duration) {
        self.state.lock().knobs.pair_delay = delay;
    }

    /// Override the maximum attribute length.
    pub fn set_max_attribute_len(&self, len: usize) {
        self.state.lock().knobs.max_attribute_len = Some(len);
    }

    /// Run `hook` inside `discover_services`, right before it answers.
    pub fn on_discover_services(&self, hook: impl Fn(LinkHandle) + Send + Sync + 'static) {
        self.state.lock().knobs.discovery_hook = Some(Arc::new(hook));
    }

    /// Run `hook` inside `attribute_write`, after the value is stored.
    pub fn on_attribute_write(&self, hook: impl Fn(LinkHandle) + Send + Sync + 'static) {
        self.state.lock().knobs.write_hook = Some(Arc::new(hook));
    }

    fn linked_address(&self, link: LinkHandle) -> Result<BdAddr> {
        self.state
            .lock()
            .links
            .get(&link)
            .copied()
            .ok_or_else(|| Error::transport(format!("{} is not established", link)))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn adapter_info(&self) -> Result<AdapterInfo> {
        Ok(AdapterInfo {
            identifier: "fake0".to_string(),
            powered: true,
            discoverable: false,
            discovering: self.is_scanning(),
        })
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn scan_start(&self, _filter: &DiscoveryFilter) -> Result<()> {
        let mut state = self.state.lock();
        state.scanning = true;
        state.scan_starts += 1;
        Ok(())
    }

    async fn scan_stop(&self) -> Result<()> {
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn link_connect(
        &self,
        address: BdAddr,
        _address_type: AddressType,
    ) -> Result<LinkHandle> {
        let (delay, error) = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            (state.knobs.connect_delay, state.knobs.connect_error.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = error {
            return Err(Error::transport(reason));
        }

        let mut state = self.state.lock();
        if !state.peripherals.contains_key(&address) {
            return Err(Error::transport(format!("{} did not respond", address)));
        }
        state.next_link += 1;
        let link = LinkHandle(state.next_link);
        state.links.insert(link, address);
        trace!("fake: {} up for {}", link, address);
        Ok(link)
    }

    async fn link_disconnect(&self, link: LinkHandle) -> Result<()> {
        self.state.lock().links.remove(&link);
        Ok(())
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<Vec<ServiceDefinition>> {
        let delay = self.state.lock().knobs.discovery_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let address = self.linked_address(link)?;
        let (services, hook) = {
            let state = self.state.lock();
            let services = state
                .peripherals
                .get(&address)
                .map(|e| e.table.services.clone())
                .unwrap_or_default();
            (services, state.knobs.discovery_hook.clone())
        };
        if let Some(hook) = hook {
            hook(link);
        }
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        link: LinkHandle,
        service: AttributeHandle,
    ) -> Result<Vec<CharacteristicDefinition>> {
        let address = self.linked_address(link)?;
        let state = self.state.lock();
        Ok(state
            .peripherals
            .get(&address)
            .and_then(|e| e.table.characteristics.get(&service).cloned())
            .unwrap_or_default())
    }

    async fn discover_descriptors(
        &self,
        link: LinkHandle,
        characteristic: AttributeHandle,
    ) -> Result<Vec<DescriptorDefinition>> {
        let address = self.linked_address(link)?;
        let state = self.state.lock();
        if state.knobs.fail_descriptor_discovery {
            return Err(Error::transport("descriptor discovery rejected"));
        }
        Ok(state
            .peripherals
            .get(&address)
            .and_then(|e| e.table.descriptors.get(&characteristic).cloned())
            .unwrap_or_default())
    }

    async fn attribute_read(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
    ) -> Result<Vec<u8>> {
        let delay = self.state.lock().knobs.read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let address = self.linked_address(link)?;
        let state = self.state.lock();
        state
            .peripherals
            .get(&address)
            .and_then(|e| e.table.values.get(&attribute).cloned())
            .ok_or_else(|| Error::transport(format!("invalid handle {}", attribute)))
    }

    async fn attribute_write(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
        value: Vec<u8>,
        ack_required: bool,
    ) -> Result<()> {
        let address = self.linked_address(link)?;
        let (delay, hook) = {
            let mut state = self.state.lock();
            state.writes.push(RecordedWrite {
                address,
                attribute,
                value: value.clone(),
                ack_required,
            });
            if let Some(entry) = state.peripherals.get_mut(&address) {
                entry.table.values.insert(attribute, value);
            }
            (state.knobs.ack_delay, state.knobs.write_hook.clone())
        };

        if let Some(hook) = hook {
            hook(link);
        }
        if ack_required && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn max_attribute_len(&self, _link: LinkHandle) -> usize {
        self.state
            .lock()
            .knobs
            .max_attribute_len
            .unwrap_or(DEFAULT_MAX_ATTRIBUTE_LEN)
    }

    async fn pair(&self, link: LinkHandle) -> Result<()> {
        self.linked_address(link)?;
        let delay = self.state.lock().knobs.pair_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().pairings += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ADDR: BdAddr = BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    const SVC: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    const LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    fn battery() -> FakePeripheral {
        FakePeripheral::new(ADDR).with_name("Battery").with_service(
            FakeService::new(SVC).with_characteristic(
                FakeCharacteristic::new(
                    LEVEL,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )
                .with_value(vec![87]),
            ),
        )
    }

    #[test]
    fn test_handles_follow_server_layout() {
        let transport = FakeTransport::new();
        transport.add_peripheral(battery());

        tokio_test::block_on(async {
            let link = transport.link_connect(ADDR, AddressType::Public).await.unwrap();
            let services = transport.discover_services(link).await.unwrap();
            assert_eq!(services[0].handle, AttributeHandle(1));

            let chars = transport.discover_characteristics(link, services[0].handle).await.unwrap();
            assert_eq!(chars[0].handle, AttributeHandle(3));

            let descs = transport.discover_descriptors(link, chars[0].handle).await.unwrap();
            assert_eq!(descs.len(), 1);
            assert_eq!(descs[0].uuid, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID);

            assert_eq!(transport.attribute_read(link, chars[0].handle).await.unwrap(), vec![87]);
        });
    }

    #[test]
    fn test_scan_and_advertise() {
        let transport = FakeTransport::new();
        transport.add_peripheral(battery());
        let mut events = transport.events();

        tokio_test::block_on(transport.scan_start(&DiscoveryFilter::new())).unwrap();
        assert!(transport.is_scanning());
        assert_eq!(transport.scan_starts(), 1);

        assert!(transport.advertise(ADDR));
        assert!(!transport.advertise(BdAddr::default()));
        match events.try_recv().unwrap() {
            TransportEvent::AdvertisementSeen(adv) => {
                assert_eq!(adv.address, ADDR);
                assert_eq!(adv.name.as_deref(), Some("Battery"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        tokio_test::block_on(transport.scan_stop()).unwrap();
        assert!(!transport.is_scanning());
    }

    #[test]
    fn test_notify_and_drop_need_a_link() {
        let transport = FakeTransport::new();
        transport.add_peripheral(battery());

        assert!(!transport.notify(ADDR, &LEVEL, vec![50]));
        assert!(!transport.drop_link(ADDR, "gone"));

        let link = tokio_test::block_on(transport.link_connect(ADDR, AddressType::Public)).unwrap();
        assert!(transport.is_linked(ADDR));
        assert!(transport.notify(ADDR, &LEVEL, vec![50]));
        assert!(transport.drop_link(ADDR, "gone"));
        assert!(!transport.is_linked(ADDR));

        let err =
            tokio_test::block_on(transport.attribute_read(link, AttributeHandle(3))).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn test_injected_connect_error() {
        let transport = FakeTransport::new();
        transport.add_peripheral(battery());
        transport.set_connect_error(Some("page timeout"));

        let err =
            tokio_test::block_on(transport.link_connect(ADDR, AddressType::Public)).unwrap_err();
        assert_eq!(err, Error::transport("page timeout"));
        assert_eq!(transport.connect_calls(), 1);
    }
}
