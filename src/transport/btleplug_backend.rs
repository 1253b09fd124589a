//! [`Transport`] on top of `btleplug`.
//!
//! btleplug works with UUID-addressed attributes rather than handles, so
//! each link gets a synthetic handle table built during discovery. The
//! Client Characteristic Configuration descriptor is mapped onto btleplug's
//! subscribe/unsubscribe calls; platforms that hide it get one synthesised
//! for every notifying characteristic.

use async_trait::async_trait;
use btleplug::api::{
    AddressType as BtAddressType, Central, CentralEvent, CentralState,
    Characteristic as BtCharacteristic, Descriptor as BtDescriptor, Manager as _, Peripheral as _,
    ScanFilter, Service as BtService, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{
    AdapterInfo, AttributeHandle, CharacteristicDefinition, DescriptorDefinition, LinkHandle,
    ServiceDefinition, Transport, TransportEvent,
};
use crate::ble::address::{AddressType, BdAddr};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::CharacteristicProperties;
use crate::ble::scanner::DiscoveryFilter;
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID;
use crate::error::{Error, Result};

enum BtAttribute {
    Service(BtService),
    Characteristic(BtCharacteristic),
    Descriptor(BtDescriptor),
    /// CCCD of the characteristic; writes become (un)subscribe calls.
    ClientConfig(BtCharacteristic),
}

struct LinkEntry {
    peripheral: Peripheral,
    attributes: HashMap<AttributeHandle, BtAttribute>,
    next_handle: u16,
    notifications: Option<JoinHandle<()>>,
}

impl LinkEntry {
    fn insert(&mut self, attribute: BtAttribute) -> AttributeHandle {
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = AttributeHandle(self.next_handle);
        self.attributes.insert(handle, attribute);
        handle
    }

    fn value_handle_of(&self, uuid: &uuid::Uuid) -> Option<AttributeHandle> {
        self.attributes
            .iter()
            .filter(|(_, a)| matches!(a, BtAttribute::Characteristic(c) if c.uuid == *uuid))
            .map(|(h, _)| *h)
            .min()
    }
}

type Links = Arc<RwLock<HashMap<LinkHandle, LinkEntry>>>;

/// Transport backed by the platform Bluetooth stack through `btleplug`.
pub struct BtleplugTransport {
    adapter: Adapter,
    links: Links,
    next_link: AtomicU64,
    powered: Arc<AtomicBool>,
    event_tx: broadcast::Sender<TransportEvent>,
    events_handle: RwLock<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first adapter.
    ///
    /// # Errors
    ///
    /// [`Error::BluetoothUnavailable`] when there is no adapter.
    pub async fn new(event_capacity: usize) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        Self::with_adapter(adapter, event_capacity).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter, event_capacity: usize) -> Result<Self> {
        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let (event_tx, _) = broadcast::channel(event_capacity);
        let transport = Self {
            adapter,
            links: Arc::new(RwLock::new(HashMap::new())),
            next_link: AtomicU64::new(1),
            powered: Arc::new(AtomicBool::new(true)),
            event_tx,
            events_handle: RwLock::new(None),
        };
        transport.spawn_event_task().await?;

        Ok(transport)
    }

    async fn spawn_event_task(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let links = self.links.clone();
        let powered = self.powered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_central_event(event, &adapter, &links, &powered, &event_tx).await;
            }
            debug!("Adapter event stream ended");
        });

        *self.events_handle.write() = Some(handle);
        Ok(())
    }

    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        links: &Links,
        powered: &AtomicBool,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if let Some(adv) = Self::advertisement_for(adapter, &id).await {
                    let _ = event_tx.send(TransportEvent::AdvertisementSeen(adv));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let lost = {
                    let mut links = links.write();
                    let link = links
                        .iter()
                        .find(|(_, entry)| entry.peripheral.id() == id)
                        .map(|(link, _)| *link);
                    link.and_then(|link| links.remove(&link).map(|entry| (link, entry)))
                };

                if let Some((link, entry)) = lost {
                    if let Some(task) = entry.notifications {
                        task.abort();
                    }
                    debug!("Peripheral {:?} dropped {}", id, link);
                    let _ = event_tx.send(TransportEvent::LinkLost {
                        link,
                        reason: "peripheral disconnected".to_string(),
                    });
                }
            }
            CentralEvent::StateUpdate(state) => {
                let on = matches!(state, CentralState::PoweredOn);
                info!("Adapter powered: {}", on);
                powered.store(on, Ordering::SeqCst);
            }
            other => trace!("Ignoring adapter event: {:?}", other),
        }
    }

    async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let address_type = match properties.address_type {
            Some(BtAddressType::Random) => AddressType::Random,
            _ => AddressType::Public,
        };

        let address = BdAddr::new(properties.address.into_inner());
        let mut adv = Advertisement::new(address, address_type);
        adv.name = properties.local_name;
        adv.rssi = properties.rssi;
        adv.tx_power = properties.tx_power_level;
        adv.class = properties.class;
        adv.service_uuids = properties.services;
        adv.manufacturer_data = properties.manufacturer_data;
        adv.service_data = properties.service_data;
        Some(adv)
    }

    async fn find_peripheral(&self, address: BdAddr) -> Result<Peripheral> {
        let wanted = address.into_bytes();
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().into_inner() == wanted)
            .ok_or_else(|| Error::not_found(format!("peripheral {}", address)))
    }

    fn peripheral(&self, link: LinkHandle) -> Result<Peripheral> {
        self.links
            .read()
            .get(&link)
            .map(|e| e.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn spawn_notification_task(&self, link: LinkHandle, peripheral: Peripheral) -> JoinHandle<()> {
        let links = self.links.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream for {}: {}", link, e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let attribute = links
                    .read()
                    .get(&link)
                    .and_then(|e| e.value_handle_of(&notification.uuid));

                match attribute {
                    Some(attribute) => {
                        trace!(
                            "{}: {} bytes from {}",
                            link,
                            notification.value.len(),
                            notification.uuid
                        );
                        let _ = event_tx.send(TransportEvent::ValueChanged {
                            link,
                            attribute,
                            value: Bytes::from(notification.value),
                        });
                    }
                    None => trace!("{}: notification from unknown {}", link, notification.uuid),
                }
            }

            debug!("Notification stream for {} ended", link);
        })
    }

    fn attribute<T>(
        &self,
        link: LinkHandle,
        handle: AttributeHandle,
        f: impl FnOnce(&BtAttribute) -> Option<T>,
    ) -> Result<T> {
        let links = self.links.read();
        let entry = links.get(&link).ok_or(Error::NotConnected)?;
        entry
            .attributes
            .get(&handle)
            .and_then(f)
            .ok_or_else(|| Error::transport(format!("invalid handle {} on {}", handle, link)))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.events_handle.write().take() {
            handle.abort();
        }
        for entry in self.links.write().values_mut() {
            if let Some(task) = entry.notifications.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn adapter_info(&self) -> Result<AdapterInfo> {
        let identifier = self.adapter.adapter_info().await?;
        Ok(AdapterInfo {
            identifier,
            powered: self.powered.load(Ordering::SeqCst),
            discoverable: false,
            discovering: false,
        })
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn scan_start(&self, filter: &DiscoveryFilter) -> Result<()> {
        let scan_filter = ScanFilter {
            services: filter.service_uuids.clone(),
        };
        self.adapter.start_scan(scan_filter).await?;
        Ok(())
    }

    async fn scan_stop(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn link_connect(
        &self,
        address: BdAddr,
        _address_type: AddressType,
    ) -> Result<LinkHandle> {
        let peripheral = self.find_peripheral(address).await?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }

        let link = LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst));
        let notifications = self.spawn_notification_task(link, peripheral.clone());
        self.links.write().insert(
            link,
            LinkEntry {
                peripheral,
                attributes: HashMap::new(),
                next_handle: 0,
                notifications: Some(notifications),
            },
        );

        debug!("{} established to {}", link, address);
        Ok(link)
    }

    async fn link_disconnect(&self, link: LinkHandle) -> Result<()> {
        let entry = self.links.write().remove(&link);
        let Some(entry) = entry else {
            return Ok(());
        };

        if let Some(task) = entry.notifications {
            task.abort();
        }

        match entry.peripheral.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Error disconnecting {}: {}", link, e);
                Err(e.into())
            }
        }
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<Vec<ServiceDefinition>> {
        let peripheral = self.peripheral(link)?;
        peripheral.discover_services().await?;

        let mut links = self.links.write();
        let entry = links.get_mut(&link).ok_or(Error::NotConnected)?;
        entry.attributes.clear();
        entry.next_handle = 0;

        let definitions = peripheral
            .services()
            .into_iter()
            .map(|service| {
                let uuid = service.uuid;
                let primary = service.primary;
                let handle = entry.insert(BtAttribute::Service(service));
                ServiceDefinition {
                    handle,
                    uuid,
                    primary,
                }
            })
            .collect();

        Ok(definitions)
    }

    async fn discover_characteristics(
        &self,
        link: LinkHandle,
        service: AttributeHandle,
    ) -> Result<Vec<CharacteristicDefinition>> {
        let characteristics = self.attribute(link, service, |a| match a {
            BtAttribute::Service(s) => Some(s.characteristics.iter().cloned().collect::<Vec<_>>()),
            _ => None,
        })?;

        let mut links = self.links.write();
        let entry = links.get_mut(&link).ok_or(Error::NotConnected)?;

        Ok(characteristics
            .into_iter()
            .map(|characteristic| {
                let uuid = characteristic.uuid;
                let properties =
                    CharacteristicProperties::from_bits_truncate(characteristic.properties.bits());
                let handle = entry.insert(BtAttribute::Characteristic(characteristic));
                CharacteristicDefinition {
                    handle,
                    uuid,
                    properties,
                }
            })
            .collect())
    }

    async fn discover_descriptors(
        &self,
        link: LinkHandle,
        characteristic: AttributeHandle,
    ) -> Result<Vec<DescriptorDefinition>> {
        let characteristic = self.attribute(link, characteristic, |a| match a {
            BtAttribute::Characteristic(c) => Some(c.clone()),
            _ => None,
        })?;

        let mut links = self.links.write();
        let entry = links.get_mut(&link).ok_or(Error::NotConnected)?;
        let mut definitions = Vec::new();
        let mut has_cccd = false;

        for descriptor in &characteristic.descriptors {
            let uuid = descriptor.uuid;
            let handle = if uuid == CLIENT_CHARACTERISTIC_CONFIGURATION_UUID {
                has_cccd = true;
                entry.insert(BtAttribute::ClientConfig(characteristic.clone()))
            } else {
                entry.insert(BtAttribute::Descriptor(descriptor.clone()))
            };
            definitions.push(DescriptorDefinition { handle, uuid });
        }

        let properties =
            CharacteristicProperties::from_bits_truncate(characteristic.properties.bits());
        if !has_cccd && properties.can_subscribe() {
            let handle = entry.insert(BtAttribute::ClientConfig(characteristic.clone()));
            definitions.push(DescriptorDefinition {
                handle,
                uuid: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
            });
        }

        Ok(definitions)
    }

    async fn attribute_read(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
    ) -> Result<Vec<u8>> {
        enum Target {
            Characteristic(BtCharacteristic),
            Descriptor(BtDescriptor),
            ClientConfig,
        }

        let peripheral = self.peripheral(link)?;
        let target = self.attribute(link, attribute, |a| match a {
            BtAttribute::Characteristic(c) => Some(Target::Characteristic(c.clone())),
            BtAttribute::Descriptor(d) => Some(Target::Descriptor(d.clone())),
            BtAttribute::ClientConfig(_) => Some(Target::ClientConfig),
            BtAttribute::Service(_) => None,
        })?;

        match target {
            Target::Characteristic(c) => Ok(peripheral.read(&c).await?),
            Target::Descriptor(d) => Ok(peripheral.read_descriptor(&d).await?),
            Target::ClientConfig => Err(Error::NotSupported {
                operation: "reading the client configuration".to_string(),
            }),
        }
    }

    async fn attribute_write(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
        value: Vec<u8>,
        ack_required: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        let target = self.attribute(link, attribute, |a| match a {
            BtAttribute::Service(_) => None,
            BtAttribute::Characteristic(c) => Some(BtAttribute::Characteristic(c.clone())),
            BtAttribute::Descriptor(d) => Some(BtAttribute::Descriptor(d.clone())),
            BtAttribute::ClientConfig(c) => Some(BtAttribute::ClientConfig(c.clone())),
        })?;

        match target {
            BtAttribute::Characteristic(c) => {
                let write_type = if ack_required {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                peripheral.write(&c, &value, write_type).await?;
            }
            BtAttribute::Descriptor(d) => peripheral.write_descriptor(&d, &value).await?,
            BtAttribute::ClientConfig(c) => {
                if value.first().map_or(false, |b| b & 0x03 != 0) {
                    peripheral.subscribe(&c).await?;
                } else {
                    peripheral.unsubscribe(&c).await?;
                }
            }
            BtAttribute::Service(_) => {}
        }

        Ok(())
    }
}
