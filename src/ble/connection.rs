//! BLE connection management.
//!
//! One [`ConnectionManager`] per device drives the link through
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
//! A connect attempt runs on its own task; concurrent `connect` calls join
//! the attempt in flight and all observe its outcome.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::address::BdAddr;
use crate::ble::catalog::GattCatalog;
use crate::ble::io::AttributeIo;
use crate::config::EngineConfig;
use crate::device::DeviceProperties;
use crate::error::{Error, Operation, Result};
use crate::transport::{AttributeHandle, LinkHandle, Transport};
use bytes::Bytes;

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Link being established or services being resolved.
    Connecting,
    /// Link established.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state machine moved to a new state.
    StateChanged {
        /// Device address.
        address: BdAddr,
        /// The new state.
        state: ConnectionState,
    },
    /// The transport link is up; services are not resolved yet.
    LinkUp {
        /// Device address.
        address: BdAddr,
    },
    /// The GATT catalog is ready; `connect()` resolves right after this.
    ServicesResolved {
        /// Device address.
        address: BdAddr,
    },
    /// The peer or the radio dropped the link.
    LinkLost {
        /// Device address.
        address: BdAddr,
        /// Reason reported by the transport.
        reason: String,
    },
}

/// State shared by every device of one manager.
pub(crate) struct ConnectionContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) adapter_id: String,
    links: RwLock<HashMap<LinkHandle, Weak<ConnectionManager>>>,
    next_session: AtomicU64,
}

impl ConnectionContext {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        adapter_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config: Arc::new(config),
            adapter_id,
            links: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// The connection owning a link, if it is still alive.
    pub(crate) fn connection_for(&self, link: LinkHandle) -> Option<Arc<ConnectionManager>> {
        self.links.read().get(&link).and_then(Weak::upgrade)
    }
}

/// One established link and everything that lives as long as it does.
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) link: LinkHandle,
    closed: watch::Sender<bool>,
    catalog: OnceLock<Arc<GattCatalog>>,
    pub(crate) io: AttributeIo,
}

impl Session {
    pub(crate) fn catalog(&self) -> Option<Arc<GattCatalog>> {
        self.catalog.get().cloned()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail in-flight I/O and stop notification delivery.
    fn close(&self) {
        self.closed.send_replace(true);
        self.io.close();
        if let Some(catalog) = self.catalog.get() {
            catalog.reset_subscriptions();
        }
    }
}

/// Resolves once the watched session is closed (or its sender is gone).
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct ConnectAttempt {
    outcome: watch::Receiver<Option<Result<()>>>,
    cancel: Arc<Notify>,
}

/// Manages the connection of one device.
pub struct ConnectionManager {
    /// Shared transport, configuration and link table.
    ctx: Arc<ConnectionContext>,
    /// The peer.
    address: BdAddr,
    /// Device properties shared with the owning device.
    properties: Arc<RwLock<DeviceProperties>>,
    /// Current connection state.
    state: RwLock<ConnectionState>,
    /// Active session while a link exists.
    session: RwLock<Option<Arc<Session>>>,
    /// Connect attempt in flight.
    attempt: Mutex<Option<ConnectAttempt>>,
    /// Pairing exchange in flight.
    pairing: Mutex<Option<Arc<Notify>>>,
    /// Profiles connected on top of the link.
    profiles: RwLock<HashSet<Uuid>>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    weak_self: Weak<Self>,
}

impl ConnectionManager {
    pub(crate) fn new(
        ctx: Arc<ConnectionContext>,
        address: BdAddr,
        properties: Arc<RwLock<DeviceProperties>>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(ctx.config.event_capacity);

        Arc::new_cyclic(|weak_self| Self {
            ctx,
            address,
            properties,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            attempt: Mutex::new(None),
            pairing: Mutex::new(None),
            profiles: RwLock::new(HashSet::new()),
            event_tx,
            weak_self: weak_self.clone(),
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// The catalog of the current session.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] until services are resolved.
    pub fn catalog(&self) -> Result<Arc<GattCatalog>> {
        self.ready_session()?.catalog().ok_or(Error::NotConnected)
    }

    /// Connect using the configured timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.ctx.config.connect_timeout).await
    }

    /// Connect and resolve services.
    ///
    /// Resolves once the GATT catalog is usable. `timeout` bounds link
    /// establishment; service discovery has its own configured deadline.
    /// While an attempt is in flight, further calls join it.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInProgress`] when connected or disconnecting
    /// - [`Error::Timeout`] when the link or discovery deadline passes
    /// - [`Error::Transport`] / [`Error::ServiceDiscoveryFailed`] on failures
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        let (mut outcome, joined) = {
            let mut attempt = self.attempt.lock();
            match attempt.as_ref() {
                Some(pending) => {
                    debug!("{}: joining connection attempt in flight", self.address);
                    (pending.outcome.clone(), true)
                }
                None => {
                    let state = self.state();
                    if state != ConnectionState::Disconnected {
                        return Err(Error::AlreadyInProgress {
                            address: self.address.to_string(),
                        });
                    }
                    if self.properties.read().blocked {
                        return Err(Error::NotSupported {
                            operation: format!("connect to blocked device {}", self.address),
                        });
                    }
                    let this = self.weak_self.upgrade().ok_or(Error::NotConnected)?;

                    self.set_state(ConnectionState::Connecting);

                    let (tx, rx) = watch::channel(None);
                    let cancel = Arc::new(Notify::new());
                    tokio::spawn(this.run_attempt(timeout, cancel.clone(), tx));

                    *attempt = Some(ConnectAttempt {
                        outcome: rx.clone(),
                        cancel,
                    });
                    (rx, false)
                }
            }
        };

        if !joined {
            return wait_outcome(&mut outcome).await;
        }

        // The attempt keeps running for whoever started it.
        match tokio::time::timeout(timeout, wait_outcome(&mut outcome)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: Operation::Connect,
            }),
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        timeout: Duration,
        cancel: Arc<Notify>,
        outcome: watch::Sender<Option<Result<()>>>,
    ) {
        info!("Connecting to {}", self.address);

        let mut result = tokio::select! {
            r = self.establish(timeout) => r,
            _ = cancel.notified() => Err(Error::transport("connection attempt cancelled")),
        };

        // Checked under the attempt lock: `handle_link_lost` either sees the
        // attempt and leaves cleanup to us, or sees it gone and tears down.
        let settled = {
            let mut attempt = self.attempt.lock();
            if result.is_ok() && self.session_closed() {
                result = Err(Error::transport(format!("link to {} lost", self.address)));
            }
            if result.is_ok() {
                *attempt = None;
            }
            result.is_ok()
        };

        match &result {
            Ok(()) => info!("Connected to {}", self.address),
            Err(e) => {
                warn!("Connection to {} failed: {}", self.address, e);
                self.abandon_session().await;
            }
        }

        if !settled {
            *self.attempt.lock() = None;
        }
        let _ = outcome.send(Some(result));
    }

    fn session_closed(&self) -> bool {
        match self.session.read().as_ref() {
            Some(session) => session.is_closed(),
            None => true,
        }
    }

    async fn establish(&self, timeout: Duration) -> Result<()> {
        let transport = self.ctx.transport.clone();
        let address_type = self.properties.read().address_type;

        let connecting = transport.link_connect(self.address, address_type);
        let link = match tokio::time::timeout(timeout, connecting).await {
            Ok(link) => link?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: Operation::Connect,
                })
            }
        };

        let session_id = self.ctx.next_session.fetch_add(1, Ordering::SeqCst);
        let (closed, closed_rx) = watch::channel(false);
        let session = Arc::new(Session {
            id: session_id,
            link,
            closed,
            catalog: OnceLock::new(),
            io: AttributeIo::new(
                transport.clone(),
                self.address,
                link,
                session_id,
                closed_rx.clone(),
            ),
        });

        self.ctx.links.write().insert(link, self.weak_self.clone());
        *self.session.write() = Some(session.clone());
        self.properties.write().connected = true;
        self.set_state(ConnectionState::Connected);
        let _ = self.event_tx.send(ConnectionEvent::LinkUp {
            address: self.address,
        });
        debug!("{}: {} up, resolving services", self.address, link);

        let mut closed_rx = closed_rx;
        let discovery = GattCatalog::discover(transport.as_ref(), link, session_id);
        let lost_during_discovery = || Error::ServiceDiscoveryFailed {
            reason: "link lost during discovery".to_string(),
        };
        let catalog = tokio::select! {
            r = tokio::time::timeout(self.ctx.config.discovery_timeout, discovery) => match r {
                Ok(catalog) => catalog?,
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: Operation::ServiceDiscovery,
                    })
                }
            },
            _ = wait_closed(&mut closed_rx) => return Err(lost_during_discovery()),
        };
        // Discovery can finish in the same poll that closed the session.
        if *closed_rx.borrow() {
            return Err(lost_during_discovery());
        }

        debug!(
            "{}: resolved {} services",
            self.address,
            catalog.services().len()
        );
        let _ = session.catalog.set(Arc::new(catalog));
        let _ = self.event_tx.send(ConnectionEvent::ServicesResolved {
            address: self.address,
        });

        Ok(())
    }

    /// Release whatever a failed attempt left behind.
    async fn abandon_session(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close();
            self.ctx.links.write().remove(&session.link);
            self.release_link(session.link).await.ok();
        }
        self.finish_disconnect();
    }

    async fn release_link(&self, link: LinkHandle) -> Result<()> {
        let timeout = self.ctx.config.disconnect_timeout;
        match tokio::time::timeout(timeout, self.ctx.transport.link_disconnect(link)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("{}: failed to release {}: {}", self.address, link, e);
                Err(e)
            }
            Err(_) => {
                warn!("{}: releasing {} timed out", self.address, link);
                Err(Error::Timeout {
                    operation: Operation::Disconnect,
                })
            }
        }
    }

    fn finish_disconnect(&self) {
        self.properties.write().connected = false;
        self.profiles.write().clear();
        if let Some(pairing) = self.pairing.lock().take() {
            pairing.notify_one();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect from the device.
    ///
    /// Cancels a connect attempt in flight. Does nothing when already
    /// disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let pending = self
            .attempt
            .lock()
            .as_ref()
            .map(|a| (a.cancel.clone(), a.outcome.clone()));

        if let Some((cancel, mut outcome)) = pending {
            info!("Cancelling connection attempt to {}", self.address);
            cancel.notify_one();
            // The attempt may still have won the race; fall through and
            // tear down whatever it produced.
            let _ = wait_outcome(&mut outcome).await;
        }

        if !self.transition(ConnectionState::Connected, ConnectionState::Disconnecting) {
            debug!("{}: not connected, ignoring disconnect", self.address);
            return Ok(());
        }

        info!("Disconnecting from {}", self.address);

        let session = self.session.write().take();
        let result = match session {
            Some(session) => {
                session.close();
                self.ctx.links.write().remove(&session.link);
                self.release_link(session.link).await
            }
            None => Ok(()),
        };

        self.finish_disconnect();
        result
    }

    /// Called by the event pump when the transport reports link loss.
    pub(crate) fn handle_link_lost(&self, link: LinkHandle, reason: &str) {
        let session = match self.session.read().as_ref() {
            Some(s) if s.link == link => s.clone(),
            _ => return,
        };

        warn!("{}: link lost ({})", self.address, reason);
        session.close();

        // A connect attempt in flight cleans up after itself.
        if self.attempt.lock().is_some() {
            return;
        }

        if !self.transition(ConnectionState::Connected, ConnectionState::Disconnecting) {
            return;
        }

        self.session.write().take();
        self.ctx.links.write().remove(&link);
        self.finish_disconnect();

        let _ = self.event_tx.send(ConnectionEvent::LinkLost {
            address: self.address,
            reason: reason.to_string(),
        });
    }

    /// Called by the event pump for notifications and indications.
    pub(crate) fn handle_value_changed(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
        value: Bytes,
    ) {
        let session = match self.session.read().as_ref() {
            Some(s) if s.link == link => s.clone(),
            _ => return,
        };

        if let Some(characteristic) = session
            .catalog()
            .and_then(|c| c.characteristic_by_handle(attribute))
        {
            characteristic.store_value(&value);
        }
        session.io.dispatch(attribute, value);
    }

    /// Run a pairing exchange.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without a link, [`Error::AlreadyInProgress`]
    /// while another exchange is outstanding.
    pub async fn pair(&self) -> Result<()> {
        let link = self
            .session
            .read()
            .as_ref()
            .map(|s| s.link)
            .ok_or(Error::NotConnected)?;

        let cancel = {
            let mut pairing = self.pairing.lock();
            if pairing.is_some() {
                return Err(Error::AlreadyInProgress {
                    address: self.address.to_string(),
                });
            }
            let cancel = Arc::new(Notify::new());
            *pairing = Some(cancel.clone());
            cancel
        };

        info!("Pairing with {}", self.address);
        let timeout = self.ctx.config.pairing_timeout;
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, self.ctx.transport.pair(link)) => match r {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout { operation: Operation::Pair }),
            },
            _ = cancel.notified() => Err(Error::transport("pairing cancelled")),
        };

        *self.pairing.lock() = None;

        match &result {
            Ok(()) => {
                self.properties.write().paired = true;
                info!("Paired with {}", self.address);
            }
            Err(e) => warn!("Pairing with {} failed: {}", self.address, e),
        }

        result
    }

    /// Abort an outstanding pairing exchange. No-op when none is running.
    pub async fn cancel_pairing(&self) -> Result<()> {
        let pending = self.pairing.lock().clone();
        let Some(cancel) = pending else {
            return Ok(());
        };

        cancel.notify_one();
        let link = self.session.read().as_ref().map(|s| s.link);
        if let Some(link) = link {
            self.ctx.transport.cancel_pairing(link).await?;
        }
        Ok(())
    }

    /// Whether a pairing exchange is outstanding.
    pub fn is_pairing(&self) -> bool {
        self.pairing.lock().is_some()
    }

    /// Mark a profile connected on top of the link.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] unless connected, [`Error::NotFound`] when
    /// the device neither exposes nor advertises the profile's service.
    pub fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        let catalog = self.catalog()?;
        let advertised = self.properties.read().service_uuids.contains(&uuid);
        if !catalog.has_service(&uuid) && !advertised {
            return Err(Error::not_found(format!("profile {} on {}", uuid, self.address)));
        }
        if self.profiles.write().insert(uuid) {
            debug!("{}: profile {} connected", self.address, uuid);
        }
        Ok(())
    }

    /// Mark a profile disconnected. The link stays up.
    pub fn disconnect_profile(&self, uuid: Uuid) -> Result<()> {
        self.ready_session()?;
        if self.profiles.write().remove(&uuid) {
            debug!("{}: profile {} disconnected", self.address, uuid);
        }
        Ok(())
    }

    /// Profiles currently connected.
    pub fn connected_profiles(&self) -> Vec<Uuid> {
        self.profiles.read().iter().copied().collect()
    }

    /// The session, once services are resolved.
    pub(crate) fn ready_session(&self) -> Result<Arc<Session>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        match self.session.read().as_ref() {
            Some(s) if s.catalog.get().is_some() => Ok(s.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Compare-and-set the state; emits an event on success.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = self.state.write();
            if *state != from {
                return false;
            }
            *state = to;
        }
        debug!("{}: connection state changed: {} -> {}", self.address, from, to);
        let _ = self.event_tx.send(ConnectionEvent::StateChanged {
            address: self.address,
            state: to,
        });
        true
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!(
                "{}: connection state changed: {} -> {}",
                self.address, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent::StateChanged {
                address: self.address,
                state: new_state,
            });
        }
    }
}

async fn wait_outcome(outcome: &mut watch::Receiver<Option<Result<()>>>) -> Result<()> {
    loop {
        let current = outcome.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if outcome.changed().await.is_err() {
            let last = outcome.borrow().clone();
            return last.unwrap_or_else(|| Err(Error::transport("connection attempt aborted")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::address::AddressType;
    use crate::ble::catalog::CharacteristicProperties;
    use crate::transport::{
        CharacteristicDefinition, FakeCharacteristic, FakePeripheral, FakeService, FakeTransport,
        MockTransport, ServiceDefinition,
    };
    use pretty_assertions::assert_eq;

    const ADDR: BdAddr = BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    const SVC: Uuid = Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);
    const DATA: Uuid = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);

    fn manager_for(transport: Arc<dyn Transport>, config: EngineConfig) -> Arc<ConnectionManager> {
        let ctx = ConnectionContext::new(transport, config, "test0".to_string());
        let properties = Arc::new(RwLock::new(DeviceProperties::new(
            ADDR,
            AddressType::Public,
            "test0",
        )));
        ConnectionManager::new(ctx, ADDR, properties)
    }

    fn sensor() -> FakePeripheral {
        FakePeripheral::new(ADDR).with_name("SensorTag").with_service(
            FakeService::new(SVC).with_characteristic(
                FakeCharacteristic::new(
                    DATA,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )
                .with_value(vec![0, 1, 0, 2]),
            ),
        )
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[tokio::test]
    async fn test_connect_resolves_services_first() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());
        let mut events = conn.subscribe();

        conn.connect().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.catalog().unwrap().service(&SVC).is_some());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::StateChanged { address: ADDR, state: ConnectionState::Connecting },
                ConnectionEvent::StateChanged { address: ADDR, state: ConnectionState::Connected },
                ConnectionEvent::LinkUp { address: ADDR },
                ConnectionEvent::ServicesResolved { address: ADDR },
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_millis(50));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.connect().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_millis(20));
        transport.set_connect_error(Some("page timeout"));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let (a, b) = tokio::join!(conn.connect(), conn.connect());
        assert!(matches!(a, Err(Error::Transport { .. })));
        assert_eq!(a, b);
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_to_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_secs(5));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let err = conn
            .connect_with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(err, Error::Timeout { operation: Operation::Connect });
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.properties.read().connected);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_rejected() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());

        conn.connect().await.unwrap();
        assert!(matches!(conn.connect().await, Err(Error::AlreadyInProgress { .. })));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_connecting() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_millis(30));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let _ = tokio::time::timeout(Duration::from_millis(5), conn.connect()).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        // The attempt keeps running on its own task.
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_attempt() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_secs(5));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.disconnect().await.unwrap();
        assert!(pending.await.unwrap().is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_catalog() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());

        conn.connect().await.unwrap();
        conn.connect_profile(SVC).unwrap();
        assert_eq!(conn.connected_profiles(), vec![SVC]);

        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.catalog().unwrap_err(), Error::NotConnected);
        assert!(conn.connected_profiles().is_empty());
        assert!(!transport.is_linked(ADDR));

        // Idempotent.
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_loss_tears_down() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());
        conn.connect().await.unwrap();
        let link = conn.ready_session().unwrap().link;
        let mut events = conn.subscribe();

        conn.handle_link_lost(link, "supervision timeout");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.catalog().is_err());
        let mut lost = false;
        while let Ok(event) = events.try_recv() {
            lost |= matches!(event, ConnectionEvent::LinkLost { .. });
        }
        assert!(lost);

        // The machine is reusable.
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_profiles_require_connection_and_service() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());

        assert_eq!(conn.connect_profile(SVC), Err(Error::NotConnected));

        conn.connect().await.unwrap();
        let unknown = Uuid::from_u128(0x1234);
        assert!(matches!(conn.connect_profile(unknown), Err(Error::NotFound { .. })));
        conn.connect_profile(SVC).unwrap();
        conn.disconnect_profile(SVC).unwrap();
        assert!(conn.connected_profiles().is_empty());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_pairing() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());

        assert_eq!(conn.pair().await, Err(Error::NotConnected));
        // Nothing outstanding.
        conn.cancel_pairing().await.unwrap();

        conn.connect().await.unwrap();
        conn.pair().await.unwrap();
        assert!(conn.properties.read().paired);
        assert_eq!(transport.pairings(), 1);

        // Pairing survives disconnect.
        conn.disconnect().await.unwrap();
        assert!(conn.properties.read().paired);
    }

    #[tokio::test]
    async fn test_cancel_pairing() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_pair_delay(Duration::from_secs(5));
        let conn = manager_for(transport.clone(), EngineConfig::default());
        conn.connect().await.unwrap();

        let pairing = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.pair().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.is_pairing());

        conn.cancel_pairing().await.unwrap();
        assert!(pairing.await.unwrap().is_err());
        assert!(!conn.is_pairing());
        assert!(!conn.properties.read().paired);
    }

    #[tokio::test]
    async fn test_transport_refusal_maps_to_transport_error() {
        let mut mock = MockTransport::new();
        mock.expect_link_connect()
            .times(1)
            .returning(|_, _| Err(Error::transport("adapter busy")));
        let conn = manager_for(Arc::new(mock), EngineConfig::default());

        let err = conn.connect().await.unwrap_err();
        assert_eq!(err, Error::transport("adapter busy"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_discovery_failure_releases_link() {
        let mut mock = MockTransport::new();
        mock.expect_link_connect()
            .returning(|_, _| Ok(LinkHandle(9)));
        mock.expect_discover_services().returning(|_| {
            Ok(vec![ServiceDefinition {
                handle: AttributeHandle(1),
                uuid: SVC,
                primary: true,
            }])
        });
        mock.expect_discover_characteristics().returning(|_, _| {
            Ok(vec![CharacteristicDefinition {
                handle: AttributeHandle(3),
                uuid: DATA,
                properties: CharacteristicProperties::READ,
            }])
        });
        mock.expect_discover_descriptors()
            .returning(|_, _| Err(Error::transport("link dropped")));
        mock.expect_link_disconnect()
            .withf(|link| *link == LinkHandle(9))
            .times(1)
            .returning(|_| Ok(()));

        let conn = manager_for(Arc::new(mock), EngineConfig::default());
        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, Error::ServiceDiscoveryFailed { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.catalog().is_err());
    }

    #[tokio::test]
    async fn test_joined_connect_honours_its_own_timeout() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_connect_delay(Duration::from_secs(5));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect_with_timeout(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = conn
            .connect_with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout { operation: Operation::Connect });
        // The shared attempt is still running.
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(transport.connect_calls(), 1);

        conn.disconnect().await.unwrap();
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_link_lost_as_discovery_completes_fails_connect() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        let conn = manager_for(transport.clone(), EngineConfig::default());
        let lost = Arc::new(Mutex::new(None));
        {
            let conn = Arc::downgrade(&conn);
            let lost = lost.clone();
            transport.on_discover_services(move |link| {
                *lost.lock() = Some(link);
                if let Some(conn) = conn.upgrade() {
                    conn.handle_link_lost(link, "peer reset");
                }
            });
        }

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::ServiceDiscoveryFailed { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.properties.read().connected);
        assert!(conn.catalog().is_err());

        let link = (*lost.lock()).unwrap();
        assert!(conn.ctx.connection_for(link).is_none());
        assert!(!transport.is_linked(ADDR));
    }

    #[tokio::test]
    async fn test_slow_discovery_times_out() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_discovery_delay(Duration::from_secs(5));
        let config = EngineConfig::default().with_discovery_timeout(Duration::from_millis(20));
        let conn = manager_for(transport.clone(), config);

        let err = conn.connect().await.unwrap_err();

        assert_eq!(err, Error::Timeout { operation: Operation::ServiceDiscovery });
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!transport.is_linked(ADDR));
    }

    #[tokio::test]
    async fn test_link_loss_during_discovery() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(sensor());
        transport.set_discovery_delay(Duration::from_secs(5));
        let conn = manager_for(transport.clone(), EngineConfig::default());

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let link = conn.session.read().as_ref().map(|s| s.link).unwrap();
        conn.handle_link_lost(link, "supervision timeout");

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            Error::ServiceDiscoveryFailed {
                reason: "link lost during discovery".to_string()
            }
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.properties.read().connected);
        assert!(conn.ctx.connection_for(link).is_none());
    }
}
