//! Device registry.
//!
//! Every peripheral heard during discovery gets exactly one [`Device`],
//! keyed by address. Advertisements are merged into the existing entry;
//! waiters blocked in [`DeviceRegistry::find`] are woken on every change.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddr};
use crate::ble::advertising::Advertisement;
use crate::ble::connection::{ConnectionContext, ConnectionState};
use crate::device::{Device, DeviceProperties};
use crate::error::{Error, Result};

/// Criteria for [`DeviceRegistry::find`]. Every field that is set must
/// match; an empty filter matches the first device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFilter {
    /// Exact address.
    pub address: Option<BdAddr>,
    /// Exact remote name.
    pub name: Option<String>,
    /// An advertised service.
    pub service_uuid: Option<Uuid>,
}

impl DeviceFilter {
    /// Match by address.
    pub fn by_address(address: BdAddr) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    /// Match by exact name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Match by advertised service.
    pub fn by_service(uuid: Uuid) -> Self {
        Self {
            service_uuid: Some(uuid),
            ..Self::default()
        }
    }

    /// Additionally require a name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Additionally require an advertised service.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuid = Some(uuid);
        self
    }

    /// Check a device's properties.
    pub fn matches(&self, properties: &DeviceProperties) -> bool {
        self.address.map_or(true, |a| a == properties.address)
            && self
                .name
                .as_ref()
                .map_or(true, |n| properties.name.as_ref() == Some(n))
            && self
                .service_uuid
                .map_or(true, |u| properties.service_uuids.contains(&u))
    }
}

impl std::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(address) = &self.address {
            parts.push(format!("address {}", address));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name {:?}", name));
        }
        if let Some(uuid) = &self.service_uuid {
            parts.push(format!("service {}", uuid));
        }
        if parts.is_empty() {
            write!(f, "any device")
        } else {
            write!(f, "device with {}", parts.join(", "))
        }
    }
}

struct Entry {
    /// Insertion order; `find` returns the earliest match.
    seq: u64,
    device: Arc<Device>,
}

/// Address-keyed set of known devices.
pub struct DeviceRegistry {
    ctx: Arc<ConnectionContext>,
    devices: RwLock<HashMap<BdAddr, Entry>>,
    next_seq: AtomicU64,
    /// Woken on every insertion or update.
    changed: Notify,
    discovered_tx: broadcast::Sender<Arc<Device>>,
}

impl DeviceRegistry {
    pub(crate) fn new(ctx: Arc<ConnectionContext>) -> Self {
        let (discovered_tx, _) = broadcast::channel(ctx.config.event_capacity);
        Self {
            ctx,
            devices: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            changed: Notify::new(),
            discovered_tx,
        }
    }

    /// Merge an advertisement into the registry.
    ///
    /// Creates the device on first sight, otherwise updates it in place.
    pub fn observe(&self, adv: &Advertisement) -> Arc<Device> {
        let (device, created) = self.get_or_insert(adv.address, adv.address_type);
        device.update_from_advertisement(adv);

        if created {
            info!(
                "Discovered {} ({})",
                adv.address,
                adv.name.as_deref().unwrap_or("unnamed")
            );
        } else {
            trace!("Updated {} (RSSI: {:?})", adv.address, adv.rssi);
        }

        self.changed.notify_waiters();
        let _ = self.discovered_tx.send(device.clone());
        device
    }

    /// The device with this address, created if unknown.
    pub fn get_or_create(&self, address: BdAddr, address_type: AddressType) -> Arc<Device> {
        let (device, created) = self.get_or_insert(address, address_type);
        if created {
            debug!("Registered {} without advertisement", address);
            self.changed.notify_waiters();
        }
        device
    }

    fn get_or_insert(&self, address: BdAddr, address_type: AddressType) -> (Arc<Device>, bool) {
        if let Some(entry) = self.devices.read().get(&address) {
            return (entry.device.clone(), false);
        }

        let mut devices = self.devices.write();
        if let Some(entry) = devices.get(&address) {
            return (entry.device.clone(), false);
        }

        let device = Arc::new(Device::new(address, address_type, self.ctx.clone()));
        devices.insert(
            address,
            Entry {
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                device: device.clone(),
            },
        );
        (device, true)
    }

    /// Look a device up by address.
    pub fn get(&self, address: &BdAddr) -> Option<Arc<Device>> {
        self.devices.read().get(address).map(|e| e.device.clone())
    }

    /// All devices in the order they were first seen.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let devices = self.devices.read();
        let mut entries: Vec<&Entry> = devices.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.device.clone()).collect()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// The earliest-seen device matching `filter`.
    pub fn first_match(&self, filter: &DeviceFilter) -> Option<Arc<Device>> {
        let devices = self.devices.read();
        devices
            .values()
            .filter(|e| e.device.properties().matches(filter))
            .min_by_key(|e| e.seq)
            .map(|e| e.device.clone())
    }

    /// Wait for a device matching `filter`.
    ///
    /// Returns immediately if one is already known. A zero timeout checks
    /// once without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if nothing matches before the deadline.
    pub async fn find(&self, filter: &DeviceFilter, timeout: Duration) -> Result<Arc<Device>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so an update in between is not lost.
            notified.as_mut().enable();

            if let Some(device) = self.first_match(filter) {
                return Ok(device);
            }

            if timeout.is_zero() || tokio::time::Instant::now() >= deadline {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        Err(Error::not_found(filter.to_string()))
    }

    /// Forget a device. Devices that are not disconnected are kept.
    ///
    /// Returns whether the device was removed.
    pub fn evict(&self, address: &BdAddr) -> bool {
        let mut devices = self.devices.write();
        match devices.get(address) {
            Some(entry) if entry.device.connection_state() != ConnectionState::Disconnected => {
                debug!("Not evicting {}: {}", address, entry.device.connection_state());
                false
            }
            Some(_) => {
                devices.remove(address);
                debug!("Evicted {}", address);
                true
            }
            None => false,
        }
    }

    /// Evict every disconnected device not heard from within `ttl`.
    pub fn evict_stale(&self, ttl: Duration) -> Vec<BdAddr> {
        let mut devices = self.devices.write();
        let stale: Vec<BdAddr> = devices
            .iter()
            .filter(|(_, e)| {
                e.device.connection_state() == ConnectionState::Disconnected
                    && e.device.is_stale(ttl)
            })
            .map(|(address, _)| *address)
            .collect();

        for address in &stale {
            devices.remove(address);
            info!("Device {} went stale", address);
        }
        stale
    }

    /// Forget every disconnected device.
    pub fn reset(&self) {
        self.devices
            .write()
            .retain(|_, e| e.device.connection_state() != ConnectionState::Disconnected);
    }

    /// Subscribe to discovered/updated devices.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Device>> {
        self.discovered_tx.subscribe()
    }
}
