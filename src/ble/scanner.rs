//! Discovery control.
//!
//! Starts and stops scanning on the transport and decides which
//! advertisements reach the device registry.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::address::BdAddr;
use crate::ble::advertising::Advertisement;
use crate::device::DeviceProperties;
use crate::error::Result;
use crate::transport::Transport;

/// Which advertisements a discovery session accepts.
///
/// Every non-empty field must match. Fields are checked against the
/// advertisement merged with what is already known about the device, so a
/// name learnt from an earlier scan response still counts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryFilter {
    /// Accept only these addresses.
    pub addresses: HashSet<BdAddr>,
    /// Accept only these exact names.
    pub names: HashSet<String>,
    /// Accept devices advertising any of these services.
    pub service_uuids: Vec<Uuid>,
    /// Minimum signal strength in dBm.
    pub min_rssi: Option<i16>,
}

impl DiscoveryFilter {
    /// A filter accepting everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to an address.
    pub fn with_address(mut self, address: BdAddr) -> Self {
        self.addresses.insert(address);
        self
    }

    /// Restrict to an exact name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    /// Restrict to devices advertising a service.
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }

    /// Restrict to a minimum signal strength.
    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    /// Whether this filter accepts everything.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            && self.names.is_empty()
            && self.service_uuids.is_empty()
            && self.min_rssi.is_none()
    }

    /// Check an advertisement, with the device's known properties if any.
    pub fn accepts(&self, adv: &Advertisement, known: Option<&DeviceProperties>) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&adv.address) {
            return false;
        }

        if !self.names.is_empty() {
            let name = adv
                .name
                .as_deref()
                .or_else(|| known.and_then(|k| k.name.as_deref()));
            if !name.map_or(false, |n| self.names.contains(n)) {
                return false;
            }
        }

        if !self.service_uuids.is_empty() {
            let advertised = |uuid: &Uuid| {
                adv.service_uuids.contains(uuid)
                    || known.map_or(false, |k| k.service_uuids.contains(uuid))
            };
            if !self.service_uuids.iter().any(advertised) {
                return false;
            }
        }

        if let Some(min) = self.min_rssi {
            let rssi = adv.rssi.or_else(|| known.and_then(|k| k.rssi));
            if !rssi.map_or(false, |r| r >= min) {
                return false;
            }
        }

        true
    }
}

/// Starts and stops discovery on one transport.
///
/// There is no process-wide discovery state: each [`DeviceManager`]
/// owns its own controller.
///
/// [`DeviceManager`]: crate::DeviceManager
pub struct DiscoveryController {
    /// The transport to scan on.
    transport: Arc<dyn Transport>,
    /// Active filter; `Some` while scanning.
    active: RwLock<Option<DiscoveryFilter>>,
    /// Serialises start/stop.
    op_lock: Mutex<()>,
}

impl DiscoveryController {
    /// Create a controller for a transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: RwLock::new(None),
            op_lock: Mutex::new(()),
        }
    }

    /// Start scanning.
    ///
    /// If discovery is already running this succeeds without replacing the
    /// active filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses to scan.
    pub async fn start(&self, filter: Option<DiscoveryFilter>) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if self.active.read().is_some() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        let filter = filter.unwrap_or_default();
        info!("Starting BLE discovery");
        self.transport.scan_start(&filter).await?;
        *self.active.write() = Some(filter);

        Ok(())
    }

    /// Stop scanning. Does nothing if discovery is not running.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if self.active.read().is_none() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE discovery");
        self.transport.scan_stop().await?;
        *self.active.write() = None;

        Ok(())
    }

    /// Check if discovery is active.
    pub fn is_scanning(&self) -> bool {
        self.active.read().is_some()
    }

    /// The active filter, if discovery is running.
    pub fn filter(&self) -> Option<DiscoveryFilter> {
        self.active.read().clone()
    }

    /// Whether an advertisement should reach the registry.
    pub fn accepts(&self, adv: &Advertisement, known: Option<&DeviceProperties>) -> bool {
        match self.active.read().as_ref() {
            Some(filter) => filter.accepts(adv, known),
            None => true,
        }
    }
}
