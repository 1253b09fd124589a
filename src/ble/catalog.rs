//! GATT catalog.
//!
//! The service → characteristic → descriptor tree of one connected device.
//! A catalog is built once per connection session and never changes
//! afterwards; it is thrown away on disconnect and rebuilt on reconnect.
//!
//! Attributes sharing a UUID under the same parent are told apart by their
//! instance index, which counts earlier siblings with the same UUID in
//! discovery order. Lookups by UUID alone return the first instance.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID;
use crate::error::{Error, Result};
use crate::transport::{AttributeHandle, LinkHandle, Transport};

bitflags::bitflags! {
    /// Operations a characteristic supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CharacteristicProperties: u8 {
        /// Value may be broadcast in advertisements.
        const BROADCAST = 0x01;
        /// Value can be read.
        const READ = 0x02;
        /// Value can be written without acknowledgment.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Value can be written with acknowledgment.
        const WRITE = 0x08;
        /// Value changes can be notified.
        const NOTIFY = 0x10;
        /// Value changes can be indicated (acknowledged notifications).
        const INDICATE = 0x20;
        /// Signed writes are supported.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Extended properties descriptor is present.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether notifications or indications can be enabled.
    pub fn can_subscribe(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Whether any kind of write is supported.
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }
}

/// A discovered GATT service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    session: u64,
    handle: AttributeHandle,
    uuid: Uuid,
    instance: usize,
    primary: bool,
    characteristics: Vec<Characteristic>,
}

impl Service {
    /// Service UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Index among services sharing this UUID.
    pub fn instance(&self) -> usize {
        self.inner.instance
    }

    /// Whether this is a primary service.
    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    /// Declaration handle.
    pub fn handle(&self) -> AttributeHandle {
        self.inner.handle
    }

    /// All characteristics in discovery order.
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.inner.characteristics
    }

    /// First characteristic with the given UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<Characteristic> {
        self.characteristic_instance(uuid, 0)
    }

    /// The characteristic identified by `(uuid, instance)`.
    pub fn characteristic_instance(&self, uuid: &Uuid, instance: usize) -> Option<Characteristic> {
        self.inner
            .characteristics
            .iter()
            .find(|c| c.uuid() == *uuid && c.instance() == instance)
            .cloned()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session == other.inner.session && self.inner.handle == other.inner.handle
    }
}

impl Eq for Service {}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.inner.uuid)
            .field("instance", &self.inner.instance)
            .field("handle", &self.inner.handle)
            .field("characteristics", &self.inner.characteristics.len())
            .finish()
    }
}

/// A discovered GATT characteristic.
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

struct CharacteristicInner {
    session: u64,
    handle: AttributeHandle,
    uuid: Uuid,
    instance: usize,
    service_uuid: Uuid,
    properties: CharacteristicProperties,
    descriptors: Vec<Descriptor>,
    value: RwLock<Option<Vec<u8>>>,
    subscribed: AtomicBool,
}

impl Characteristic {
    /// Characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Index among sibling characteristics sharing this UUID.
    pub fn instance(&self) -> usize {
        self.inner.instance
    }

    /// UUID of the owning service.
    pub fn service_uuid(&self) -> Uuid {
        self.inner.service_uuid
    }

    /// Value handle.
    pub fn handle(&self) -> AttributeHandle {
        self.inner.handle
    }

    /// Supported operations.
    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    /// All descriptors in discovery order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.inner.descriptors
    }

    /// First descriptor with the given UUID.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<Descriptor> {
        self.descriptor_instance(uuid, 0)
    }

    /// The descriptor identified by `(uuid, instance)`.
    pub fn descriptor_instance(&self, uuid: &Uuid, instance: usize) -> Option<Descriptor> {
        self.inner
            .descriptors
            .iter()
            .find(|d| d.uuid() == *uuid && d.instance() == instance)
            .cloned()
    }

    /// The Client Characteristic Configuration descriptor, if present.
    pub fn client_configuration(&self) -> Option<Descriptor> {
        self.descriptor(&CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)
    }

    /// Last value read or notified, if any.
    pub fn cached_value(&self) -> Option<Vec<u8>> {
        self.inner.value.read().clone()
    }

    /// Whether notifications/indications are currently enabled.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self) -> u64 {
        self.inner.session
    }

    pub(crate) fn store_value(&self, value: &[u8]) {
        *self.inner.value.write() = Some(value.to_vec());
    }

    pub(crate) fn set_subscribed(&self, subscribed: bool) {
        self.inner.subscribed.store(subscribed, Ordering::SeqCst);
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session == other.inner.session && self.inner.handle == other.inner.handle
    }
}

impl Eq for Characteristic {}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.inner.uuid)
            .field("instance", &self.inner.instance)
            .field("handle", &self.inner.handle)
            .field("properties", &self.inner.properties)
            .finish()
    }
}

/// A discovered GATT descriptor. Descriptors are always readable and
/// writable.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    session: u64,
    handle: AttributeHandle,
    uuid: Uuid,
    instance: usize,
    characteristic_uuid: Uuid,
    value: RwLock<Option<Vec<u8>>>,
}

impl Descriptor {
    /// Descriptor UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Index among sibling descriptors sharing this UUID.
    pub fn instance(&self) -> usize {
        self.inner.instance
    }

    /// UUID of the owning characteristic.
    pub fn characteristic_uuid(&self) -> Uuid {
        self.inner.characteristic_uuid
    }

    /// Descriptor handle.
    pub fn handle(&self) -> AttributeHandle {
        self.inner.handle
    }

    /// Last value read, if any.
    pub fn cached_value(&self) -> Option<Vec<u8>> {
        self.inner.value.read().clone()
    }

    pub(crate) fn session(&self) -> u64 {
        self.inner.session
    }

    pub(crate) fn store_value(&self, value: &[u8]) {
        *self.inner.value.write() = Some(value.to_vec());
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session == other.inner.session && self.inner.handle == other.inner.handle
    }
}

impl Eq for Descriptor {}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.inner.uuid)
            .field("instance", &self.inner.instance)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

/// Read/write target: a characteristic value or a descriptor.
#[derive(Debug, Clone, Copy)]
pub enum AttributeRef<'a> {
    /// A characteristic value.
    Characteristic(&'a Characteristic),
    /// A descriptor.
    Descriptor(&'a Descriptor),
}

impl<'a> From<&'a Characteristic> for AttributeRef<'a> {
    fn from(c: &'a Characteristic) -> Self {
        Self::Characteristic(c)
    }
}

impl<'a> From<&'a Descriptor> for AttributeRef<'a> {
    fn from(d: &'a Descriptor) -> Self {
        Self::Descriptor(d)
    }
}

impl AttributeRef<'_> {
    /// UUID of the target.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Characteristic(c) => c.uuid(),
            Self::Descriptor(d) => d.uuid(),
        }
    }

    /// Transport handle of the target.
    pub fn handle(&self) -> AttributeHandle {
        match self {
            Self::Characteristic(c) => c.handle(),
            Self::Descriptor(d) => d.handle(),
        }
    }

    pub(crate) fn session(&self) -> u64 {
        match self {
            Self::Characteristic(c) => c.session(),
            Self::Descriptor(d) => d.session(),
        }
    }

    pub(crate) fn store_value(&self, value: &[u8]) {
        match self {
            Self::Characteristic(c) => c.store_value(value),
            Self::Descriptor(d) => d.store_value(value),
        }
    }
}

/// The immutable attribute tree of one connection session.
pub struct GattCatalog {
    session: u64,
    services: Vec<Service>,
    by_handle: HashMap<AttributeHandle, Characteristic>,
}

impl GattCatalog {
    /// Enumerate the full attribute tree of a linked peripheral.
    ///
    /// Services are listed first, then the characteristics of each service,
    /// then the descriptors of each characteristic. The tree is only returned
    /// once complete.
    ///
    /// # Errors
    ///
    /// Any transport failure is reported as
    /// [`Error::ServiceDiscoveryFailed`]; nothing discovered so far is kept.
    pub async fn discover(
        transport: &dyn Transport,
        link: LinkHandle,
        session: u64,
    ) -> Result<Self> {
        let failed = |stage: &str, e: Error| Error::ServiceDiscoveryFailed {
            reason: format!("{}: {}", stage, e),
        };

        let service_defs = transport
            .discover_services(link)
            .await
            .map_err(|e| failed("services", e))?;

        debug!("{}: {} services", link, service_defs.len());

        let mut services = Vec::with_capacity(service_defs.len());
        let mut service_instances = HashMap::new();

        for service_def in service_defs {
            let char_defs = transport
                .discover_characteristics(link, service_def.handle)
                .await
                .map_err(|e| failed("characteristics", e))?;

            let mut characteristics = Vec::with_capacity(char_defs.len());
            let mut char_instances = HashMap::new();

            for char_def in char_defs {
                let desc_defs = transport
                    .discover_descriptors(link, char_def.handle)
                    .await
                    .map_err(|e| failed("descriptors", e))?;

                let mut desc_instances = HashMap::new();
                let descriptors = desc_defs
                    .into_iter()
                    .map(|d| Descriptor {
                        inner: Arc::new(DescriptorInner {
                            session,
                            handle: d.handle,
                            uuid: d.uuid,
                            instance: next_instance(&mut desc_instances, d.uuid),
                            characteristic_uuid: char_def.uuid,
                            value: RwLock::new(None),
                        }),
                    })
                    .collect();

                trace!(
                    "Found characteristic: {} ({}) in service {}",
                    char_def.uuid,
                    char_def.handle,
                    service_def.uuid
                );

                characteristics.push(Characteristic {
                    inner: Arc::new(CharacteristicInner {
                        session,
                        handle: char_def.handle,
                        uuid: char_def.uuid,
                        instance: next_instance(&mut char_instances, char_def.uuid),
                        service_uuid: service_def.uuid,
                        properties: char_def.properties,
                        descriptors,
                        value: RwLock::new(None),
                        subscribed: AtomicBool::new(false),
                    }),
                });
            }

            services.push(Service {
                inner: Arc::new(ServiceInner {
                    session,
                    handle: service_def.handle,
                    uuid: service_def.uuid,
                    instance: next_instance(&mut service_instances, service_def.uuid),
                    primary: service_def.primary,
                    characteristics,
                }),
            });
        }

        Ok(Self::from_services(session, services))
    }

    fn from_services(session: u64, services: Vec<Service>) -> Self {
        let by_handle = services
            .iter()
            .flat_map(|s| s.characteristics().iter())
            .map(|c| (c.handle(), c.clone()))
            .collect();

        Self {
            session,
            services,
            by_handle,
        }
    }

    /// Id of the connection session this catalog belongs to.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// All services in discovery order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// First service with the given UUID.
    pub fn service(&self, uuid: &Uuid) -> Option<Service> {
        self.service_instance(uuid, 0)
    }

    /// The service identified by `(uuid, instance)`.
    pub fn service_instance(&self, uuid: &Uuid, instance: usize) -> Option<Service> {
        self.services
            .iter()
            .find(|s| s.uuid() == *uuid && s.instance() == instance)
            .cloned()
    }

    /// Every service with the given UUID, in discovery order.
    pub fn services_by_uuid(&self, uuid: &Uuid) -> Vec<Service> {
        self.services
            .iter()
            .filter(|s| s.uuid() == *uuid)
            .cloned()
            .collect()
    }

    /// Every characteristic with the given UUID, optionally restricted to
    /// services with the UUID `scope`.
    pub fn characteristics(&self, scope: Option<&Uuid>, uuid: &Uuid) -> Vec<Characteristic> {
        self.services
            .iter()
            .filter(|s| scope.map_or(true, |scope| s.uuid() == *scope))
            .flat_map(|s| s.characteristics().iter())
            .filter(|c| c.uuid() == *uuid)
            .cloned()
            .collect()
    }

    /// First characteristic with the given UUID, optionally restricted to
    /// services with the UUID `scope`.
    pub fn characteristic(&self, scope: Option<&Uuid>, uuid: &Uuid) -> Option<Characteristic> {
        self.services
            .iter()
            .filter(|s| scope.map_or(true, |scope| s.uuid() == *scope))
            .flat_map(|s| s.characteristics().iter())
            .find(|c| c.uuid() == *uuid)
            .cloned()
    }

    /// Characteristic owning a value handle.
    pub fn characteristic_by_handle(&self, handle: AttributeHandle) -> Option<Characteristic> {
        self.by_handle.get(&handle).cloned()
    }

    /// Whether the catalog contains a service with the given UUID.
    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.services.iter().any(|s| s.uuid() == *uuid)
    }

    pub(crate) fn reset_subscriptions(&self) {
        for characteristic in self.by_handle.values() {
            characteristic.set_subscribed(false);
        }
    }
}

impl std::fmt::Debug for GattCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattCatalog")
            .field("session", &self.session)
            .field("services", &self.services)
            .finish()
    }
}

fn next_instance(counts: &mut HashMap<Uuid, usize>, uuid: Uuid) -> usize {
    let count = counts.entry(uuid).or_insert(0);
    let instance = *count;
    *count += 1;
    instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::address::{AddressType, BdAddr};
    use crate::transport::{FakeCharacteristic, FakePeripheral, FakeService, FakeTransport};
    use pretty_assertions::assert_eq;

    const ADDR: BdAddr = BdAddr::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
    const SVC: Uuid = Uuid::from_u128(0x0000aaaa_0000_1000_8000_00805f9b34fb);
    const CHR: Uuid = Uuid::from_u128(0x0000bbbb_0000_1000_8000_00805f9b34fb);

    fn duplicate_peripheral() -> FakePeripheral {
        FakePeripheral::new(ADDR)
            .with_service(
                FakeService::new(SVC)
                    .with_characteristic(
                        FakeCharacteristic::new(CHR, CharacteristicProperties::READ)
                            .with_value(vec![1]),
                    )
                    .with_characteristic(
                        FakeCharacteristic::new(CHR, CharacteristicProperties::READ)
                            .with_value(vec![2]),
                    ),
            )
            .with_service(
                FakeService::new(SVC).with_characteristic(
                    FakeCharacteristic::new(CHR, CharacteristicProperties::NOTIFY)
                        .with_value(vec![3]),
                ),
            )
    }

    async fn discover(transport: &FakeTransport, session: u64) -> Result<GattCatalog> {
        let link = transport.link_connect(ADDR, AddressType::Public).await?;
        GattCatalog::discover(transport, link, session).await
    }

    #[test]
    fn test_properties_helpers() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::INDICATE;
        assert!(props.can_subscribe());
        assert!(!props.can_write());
        assert!(CharacteristicProperties::WRITE_WITHOUT_RESPONSE.can_write());
    }

    #[tokio::test]
    async fn test_duplicate_uuids_get_instance_indices() {
        let transport = FakeTransport::new();
        transport.add_peripheral(duplicate_peripheral());
        let catalog = discover(&transport, 1).await.unwrap();

        let services = catalog.services_by_uuid(&SVC);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].instance(), 0);
        assert_eq!(services[1].instance(), 1);

        // UUID alone resolves to the first by discovery order.
        assert_eq!(catalog.service(&SVC), Some(services[0].clone()));

        let first = services[0].characteristic(&CHR).unwrap();
        let second = services[0].characteristic_instance(&CHR, 1).unwrap();
        assert_eq!(first.instance(), 0);
        assert_eq!(second.instance(), 1);
        assert_ne!(first, second);

        assert_eq!(catalog.characteristics(None, &CHR).len(), 3);
        assert_eq!(catalog.characteristics(Some(&SVC), &CHR).len(), 3);
        assert!(catalog.characteristic(Some(&CHR), &CHR).is_none());

        let notify = services[1].characteristic(&CHR).unwrap();
        assert!(notify.client_configuration().is_some());
        assert_eq!(catalog.characteristic_by_handle(notify.handle()), Some(notify));
    }

    #[tokio::test]
    async fn test_lookups_are_stable() {
        let transport = FakeTransport::new();
        transport.add_peripheral(duplicate_peripheral());
        let catalog = discover(&transport, 7).await.unwrap();

        let a = catalog.characteristics(None, &CHR);
        let b = catalog.characteristics(None, &CHR);
        assert_eq!(a, b);
        assert_eq!(catalog.session(), 7);
    }

    #[tokio::test]
    async fn test_sessions_do_not_compare_equal() {
        let transport = FakeTransport::new();
        transport.add_peripheral(duplicate_peripheral());
        let first = discover(&transport, 1).await.unwrap();
        let second = discover(&transport, 2).await.unwrap();
        assert_ne!(first.service(&SVC), second.service(&SVC));
    }

    #[tokio::test]
    async fn test_discovery_failure_discards_tree() {
        let transport = FakeTransport::new();
        transport.add_peripheral(duplicate_peripheral());
        transport.fail_descriptor_discovery(true);
        let err = discover(&transport, 1).await.unwrap_err();
        assert!(matches!(err, Error::ServiceDiscoveryFailed { .. }));
    }
}
