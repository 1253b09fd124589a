//! Device manager.
//!
//! Owns one transport and everything hanging off it: the discovery
//! controller, the device registry and the event pump that routes
//! advertisements, notifications and link loss to the right place.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use crate::ble::address::{AddressType, BdAddr};
use crate::ble::connection::ConnectionContext;
use crate::ble::registry::{DeviceFilter, DeviceRegistry};
use crate::ble::scanner::{DiscoveryController, DiscoveryFilter};
use crate::config::EngineConfig;
use crate::device::{CallbackHandle, Device};
use crate::error::Result;
use crate::transport::{AdapterInfo, BtleplugTransport, Transport, TransportEvent};

/// Central manager for discovering and talking to BLE peripherals.
pub struct DeviceManager {
    /// The radio.
    transport: Arc<dyn Transport>,
    /// Shared connection context.
    ctx: Arc<ConnectionContext>,
    /// Known devices.
    registry: Arc<DeviceRegistry>,
    /// Discovery state.
    discovery: Arc<DiscoveryController>,
    /// Devices removed by the stale sweep.
    device_removed_tx: broadcast::Sender<BdAddr>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Event pump handle.
    background_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
}

impl DeviceManager {
    /// Create a manager on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default()).await
    }

    /// Create a manager on the first Bluetooth adapter with custom tunables.
    pub async fn with_config(config: EngineConfig) -> Result<Self> {
        let transport = BtleplugTransport::new(config.event_capacity).await?;
        Self::with_transport(Arc::new(transport), config).await
    }

    /// Create a manager on any transport.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Self> {
        let adapter = transport.adapter_info().await?;
        info!("Using adapter {}", adapter.identifier);

        let (device_removed_tx, _) = broadcast::channel(config.event_capacity);
        let ctx = ConnectionContext::new(transport.clone(), config, adapter.identifier);
        let registry = Arc::new(DeviceRegistry::new(ctx.clone()));
        let discovery = Arc::new(DiscoveryController::new(transport.clone()));

        let manager = Self {
            transport,
            ctx,
            registry,
            discovery,
            device_removed_tx,
            callback_counter: AtomicU64::new(0),
            background_handle: RwLock::new(None),
            is_running: Arc::new(AtomicBool::new(true)),
        };
        manager.spawn_event_pump();

        Ok(manager)
    }

    fn spawn_event_pump(&self) {
        // Subscribe before spawning so nothing emitted from here on is missed.
        let mut events = self.transport.events();
        let ctx = self.ctx.clone();
        let registry = self.registry.clone();
        let discovery = self.discovery.clone();
        let device_removed_tx = self.device_removed_tx.clone();
        let is_running = self.is_running.clone();
        let sweep_every = self
            .ctx
            .config
            .stale_check_interval
            .max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            Self::handle_transport_event(event, &ctx, &registry, &discovery)
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Event pump lagging, {} transport events dropped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => {
                        if let Some(ttl) = ctx.config.device_ttl {
                            for address in registry.evict_stale(ttl) {
                                let _ = device_removed_tx.send(address);
                            }
                        }
                    }
                }
            }

            debug!("Device manager event pump ended");
        });

        *self.background_handle.write() = Some(handle);
    }

    fn handle_transport_event(
        event: TransportEvent,
        ctx: &ConnectionContext,
        registry: &DeviceRegistry,
        discovery: &DiscoveryController,
    ) {
        match event {
            TransportEvent::AdvertisementSeen(adv) => {
                let known = registry.get(&adv.address).map(|d| d.properties());
                if !discovery.accepts(&adv, known.as_ref()) {
                    trace!("Filtered out advertisement from {}", adv.address);
                    return;
                }
                registry.observe(&adv);
            }
            TransportEvent::ValueChanged {
                link,
                attribute,
                value,
            } => match ctx.connection_for(link) {
                Some(connection) => connection.handle_value_changed(link, attribute, value),
                None => trace!("Value change on unknown {}", link),
            },
            TransportEvent::LinkLost { link, reason } => match ctx.connection_for(link) {
                Some(connection) => connection.handle_link_lost(link, &reason),
                None => debug!("Loss of unknown {} ({})", link, reason),
            },
        }
    }

    // === Adapter ===

    /// Describe the adapter.
    pub async fn adapter_info(&self) -> Result<AdapterInfo> {
        let mut info = self.transport.adapter_info().await?;
        info.discovering = self.discovery.is_scanning();
        Ok(info)
    }

    /// The tunables in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    // === Discovery ===

    /// Start discovery. Idempotent; a running session keeps its filter.
    pub async fn start_discovery(&self, filter: Option<DiscoveryFilter>) -> Result<()> {
        self.discovery.start(filter).await
    }

    /// Stop discovery. Idempotent.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.discovery.stop().await
    }

    /// Check if discovery is active.
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_scanning()
    }

    // === Devices ===

    /// Wait for a device matching `filter`; see [`DeviceRegistry::find`].
    pub async fn find(&self, filter: &DeviceFilter, timeout: Duration) -> Result<Arc<Device>> {
        self.registry.find(filter, timeout).await
    }

    /// Wait for a device with the given address.
    pub async fn find_by_address(&self, address: BdAddr, timeout: Duration) -> Result<Arc<Device>> {
        self.find(&DeviceFilter::by_address(address), timeout).await
    }

    /// Look a device up by address.
    pub fn device(&self, address: &BdAddr) -> Option<Arc<Device>> {
        self.registry.get(address)
    }

    /// The device with this address, registered without an advertisement
    /// if unknown (e.g. a bonded device that is not advertising).
    pub fn device_or_create(&self, address: BdAddr, address_type: AddressType) -> Arc<Device> {
        self.registry.get_or_create(address, address_type)
    }

    /// All devices in the order they were first seen.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.devices()
    }

    /// Devices sorted by signal strength (strongest first).
    pub fn devices_by_signal(&self) -> Vec<Arc<Device>> {
        let mut devices = self.registry.devices();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi().unwrap_or(i16::MIN)));
        devices
    }

    /// Get the number of known devices.
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// Forget a disconnected device.
    pub fn evict(&self, address: &BdAddr) -> bool {
        self.registry.evict(address)
    }

    /// Forget every disconnected device.
    pub fn reset(&self) {
        self.registry.reset();
    }

    /// The registry backing this manager.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to device discovery events (sent on every accepted
    /// advertisement).
    pub fn subscribe_device_discovered(&self) -> broadcast::Receiver<Arc<Device>> {
        self.registry.subscribe()
    }

    /// Register a callback for when devices are discovered/updated.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Arc<Device>) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.registry.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(device) = rx.recv().await {
                callback(device);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Subscribe to addresses removed by the stale sweep.
    pub fn subscribe_device_removed(&self) -> broadcast::Receiver<BdAddr> {
        self.device_removed_tx.subscribe()
    }

    /// Register a callback for devices removed by the stale sweep.
    pub fn on_device_removed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(BdAddr) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.device_removed_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(address) = rx.recv().await {
                callback(address);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Clean shutdown of all connections and discovery.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.stop_discovery().await?;

        for device in self.registry.devices() {
            if let Err(e) = device.disconnect().await {
                warn!("Error disconnecting {}: {}", device.address(), e);
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.background_handle.write().take() {
            handle.abort();
        }

        self.registry.reset();

        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.background_handle.write().take() {
            handle.abort();
        }
    }
}
