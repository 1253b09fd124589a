//! Attribute I/O.
//!
//! Reads, writes and notification subscriptions for one connection
//! session. Requests on a link are serialised; each request is bounded by
//! its own deadline and fails immediately when the link goes away.
//!
//! Notifications for a characteristic are queued and delivered in arrival
//! order by a dedicated task, so a slow listener never blocks the event
//! pump or other characteristics.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::address::BdAddr;
use crate::ble::catalog::{AttributeRef, Characteristic, CharacteristicProperties};
use crate::ble::connection::wait_closed;
use crate::error::{Error, Operation, Result};
use crate::transport::{AttributeHandle, LinkHandle, Transport};

/// CCCD value enabling notifications.
const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
const ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both.
const DISABLE: [u8; 2] = [0x00, 0x00];

/// Callback invoked for every notified value.
pub type Listener = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

type Listeners = Arc<RwLock<Vec<(ListenerId, Listener)>>>;

struct Subscription {
    characteristic: Characteristic,
    listeners: Listeners,
    queue: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// Attribute I/O bound to one link.
pub(crate) struct AttributeIo {
    transport: Arc<dyn Transport>,
    address: BdAddr,
    link: LinkHandle,
    session: u64,
    /// One outstanding request per link.
    request_lock: tokio::sync::Mutex<()>,
    /// Serialises CCCD changes so listener bookkeeping matches the peer.
    subscribe_lock: tokio::sync::Mutex<()>,
    closed: watch::Receiver<bool>,
    subscriptions: Mutex<HashMap<AttributeHandle, Subscription>>,
    next_listener: AtomicU64,
}

impl AttributeIo {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        address: BdAddr,
        link: LinkHandle,
        session: u64,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            address,
            link,
            session,
            request_lock: tokio::sync::Mutex::new(()),
            subscribe_lock: tokio::sync::Mutex::new(()),
            closed,
            subscriptions: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Read a characteristic value or descriptor.
    ///
    /// The value is cached on the attribute.
    pub(crate) async fn read(
        &self,
        attribute: AttributeRef<'_>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.check_session(attribute.session(), attribute.uuid())?;

        if let AttributeRef::Characteristic(c) = attribute {
            if !c.properties().contains(CharacteristicProperties::READ) {
                return Err(Error::NotPermitted {
                    operation: Operation::Read,
                    uuid: c.uuid(),
                });
            }
        }

        let value = self
            .request(
                Operation::Read,
                timeout,
                self.transport.attribute_read(self.link, attribute.handle()),
            )
            .await?;

        trace!(
            "Read {} bytes from {} on {}",
            value.len(),
            attribute.uuid(),
            self.address
        );
        attribute.store_value(&value);

        Ok(value)
    }

    /// Write a characteristic value or descriptor.
    ///
    /// Characteristics declaring `WRITE` are written with acknowledgment;
    /// ones declaring only `WRITE_WITHOUT_RESPONSE` are written without.
    pub(crate) async fn write(
        &self,
        attribute: AttributeRef<'_>,
        value: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let ack_required = match attribute {
            AttributeRef::Characteristic(c) => {
                let props = c.properties();
                if props.contains(CharacteristicProperties::WRITE) {
                    true
                } else if props.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE) {
                    false
                } else {
                    return Err(Error::NotPermitted {
                        operation: Operation::Write,
                        uuid: c.uuid(),
                    });
                }
            }
            AttributeRef::Descriptor(_) => true,
        };

        self.write_value(attribute, value, ack_required, timeout).await
    }

    /// Write a characteristic value without acknowledgment.
    pub(crate) async fn write_without_response(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        if !characteristic
            .properties()
            .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
        {
            return Err(Error::NotPermitted {
                operation: Operation::Write,
                uuid: characteristic.uuid(),
            });
        }

        self.write_value(characteristic.into(), value, false, timeout).await
    }

    async fn write_value(
        &self,
        attribute: AttributeRef<'_>,
        value: &[u8],
        ack_required: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.check_session(attribute.session(), attribute.uuid())?;

        let max = self.transport.max_attribute_len(self.link);
        if value.len() > max {
            return Err(Error::transport(format!(
                "value of {} bytes exceeds the {} byte attribute limit",
                value.len(),
                max
            )));
        }

        self.request(
            Operation::Write,
            timeout,
            self.transport
                .attribute_write(self.link, attribute.handle(), value.to_vec(), ack_required),
        )
        .await?;

        trace!(
            "Wrote {} bytes to {} on {} (ack: {})",
            value.len(),
            attribute.uuid(),
            self.address,
            ack_required
        );

        Ok(())
    }

    /// Register a listener for value changes.
    ///
    /// The first listener enables notifications (or indications when the
    /// characteristic cannot notify) through the CCCD.
    pub(crate) async fn subscribe(
        &self,
        characteristic: &Characteristic,
        listener: Listener,
        timeout: Duration,
    ) -> Result<ListenerId> {
        self.check_session(characteristic.session(), characteristic.uuid())?;

        let properties = characteristic.properties();
        if !properties.can_subscribe() {
            return Err(Error::NotSupported {
                operation: format!("notifications on {}", characteristic.uuid()),
            });
        }

        let _guard = self.subscribe_lock.lock().await;
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        let handle = characteristic.handle();

        let joined = {
            let subscriptions = self.subscriptions.lock();
            match subscriptions.get(&handle) {
                Some(sub) => {
                    sub.listeners.write().push((id, listener.clone()));
                    true
                }
                None => false,
            }
        };
        if joined {
            debug!("{}: added {} to {}", self.address, id, characteristic.uuid());
            return Ok(id);
        }

        let cccd = characteristic
            .client_configuration()
            .ok_or_else(|| Error::NotSupported {
                operation: format!(
                    "notifications on {} (no configuration descriptor)",
                    characteristic.uuid()
                ),
            })?;

        let enable = if properties.contains(CharacteristicProperties::NOTIFY) {
            ENABLE_NOTIFICATION
        } else {
            ENABLE_INDICATION
        };

        self.request(
            Operation::Subscribe,
            timeout,
            self.transport
                .attribute_write(self.link, cccd.handle(), enable.to_vec(), true),
        )
        .await?;

        {
            // `close()` drains this map after flagging the session, so a
            // check under the lock cannot miss a concurrent close.
            let mut subscriptions = self.subscriptions.lock();
            if *self.closed.borrow() {
                return Err(self.link_lost());
            }

            let (queue, rx) = mpsc::unbounded_channel();
            let listeners: Listeners = Arc::new(RwLock::new(vec![(id, listener)]));
            let task = tokio::spawn(deliver(
                self.address,
                characteristic.uuid(),
                rx,
                listeners.clone(),
            ));
            subscriptions.insert(
                handle,
                Subscription {
                    characteristic: characteristic.clone(),
                    listeners,
                    queue,
                    task,
                },
            );
        }
        characteristic.set_subscribed(true);

        debug!("{}: subscribed to {}", self.address, characteristic.uuid());

        Ok(id)
    }

    /// Remove a listener. Removing the last one disables the CCCD.
    ///
    /// Unknown listeners and stale characteristics are ignored.
    pub(crate) async fn unsubscribe(
        &self,
        characteristic: &Characteristic,
        id: ListenerId,
        timeout: Duration,
    ) -> Result<()> {
        if characteristic.session() != self.session {
            return Ok(());
        }

        let _guard = self.subscribe_lock.lock().await;
        let handle = characteristic.handle();

        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            let now_empty = match subscriptions.get(&handle) {
                Some(sub) => {
                    let mut listeners = sub.listeners.write();
                    listeners.retain(|(l, _)| *l != id);
                    listeners.is_empty()
                }
                None => false,
            };
            if now_empty {
                subscriptions.remove(&handle)
            } else {
                None
            }
        };

        let Some(sub) = removed else {
            return Ok(());
        };

        sub.task.abort();
        characteristic.set_subscribed(false);
        debug!("{}: unsubscribed from {}", self.address, characteristic.uuid());

        if *self.closed.borrow() {
            return Ok(());
        }
        let Some(cccd) = characteristic.client_configuration() else {
            return Ok(());
        };

        self.request(
            Operation::Subscribe,
            timeout,
            self.transport
                .attribute_write(self.link, cccd.handle(), DISABLE.to_vec(), true),
        )
        .await
    }

    /// Whether any listener is registered for a characteristic.
    pub(crate) fn is_subscribed(&self, characteristic: &Characteristic) -> bool {
        characteristic.session() == self.session
            && self.subscriptions.lock().contains_key(&characteristic.handle())
    }

    /// Queue a notified value for delivery.
    pub(crate) fn dispatch(&self, attribute: AttributeHandle, value: Bytes) {
        let subscriptions = self.subscriptions.lock();
        match subscriptions.get(&attribute) {
            Some(sub) => {
                let _ = sub.queue.send(value);
            }
            None => trace!("{}: unsolicited value on {}", self.address, attribute),
        }
    }

    /// Stop all delivery. Used when the session ends.
    pub(crate) fn close(&self) {
        let subscriptions: Vec<Subscription> =
            self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for sub in subscriptions {
            sub.task.abort();
            sub.characteristic.set_subscribed(false);
        }
    }

    fn check_session(&self, session: u64, uuid: Uuid) -> Result<()> {
        if session != self.session {
            return Err(Error::not_found(format!(
                "attribute {} from an earlier connection to {}",
                uuid, self.address
            )));
        }
        Ok(())
    }

    /// Run one exchange: serialised per link, bounded by `timeout`, and
    /// abandoned as soon as the link is lost.
    async fn request<T, F>(&self, operation: Operation, timeout: Duration, exchange: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Err(self.link_lost());
        }

        let serialised = async {
            let _guard = self.request_lock.lock().await;
            exchange.await
        };

        tokio::select! {
            r = tokio::time::timeout(timeout, serialised) => match r {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { operation }),
            },
            _ = wait_closed(&mut closed) => Err(self.link_lost()),
        }
    }

    fn link_lost(&self) -> Error {
        Error::transport(format!("link to {} lost", self.address))
    }
}

async fn deliver(
    address: BdAddr,
    uuid: Uuid,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    listeners: Listeners,
) {
    while let Some(value) = rx.recv().await {
        let current: Vec<Listener> = listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in current {
            listener(value.clone());
        }
    }
    trace!("{}: delivery for {} finished", address, uuid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::address::AddressType;
    use crate::ble::catalog::GattCatalog;
    use crate::ble::uuids::CHARACTERISTIC_USER_DESCRIPTION_UUID;
    use crate::transport::{FakeCharacteristic, FakePeripheral, FakeService, FakeTransport};
    use pretty_assertions::assert_eq;

    const ADDR: BdAddr = BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    const SVC: Uuid = Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);
    const DATA: Uuid = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);
    const CONFIG: Uuid = Uuid::from_u128(0xf000aa02_0451_4000_b000_000000000000);
    const COMMAND: Uuid = Uuid::from_u128(0xf000aa03_0451_4000_b000_000000000000);
    const STATUS: Uuid = Uuid::from_u128(0xf000aa04_0451_4000_b000_000000000000);
    const LEGACY: Uuid = Uuid::from_u128(0xf000aa05_0451_4000_b000_000000000000);
    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Harness {
        transport: Arc<FakeTransport>,
        catalog: GattCatalog,
        io: AttributeIo,
        closed: watch::Sender<bool>,
    }

    impl Harness {
        fn characteristic(&self, uuid: &Uuid) -> Characteristic {
            self.catalog.characteristic(None, uuid).unwrap()
        }
    }

    async fn harness() -> Harness {
        let readable_notify = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        let read_write = CharacteristicProperties::READ | CharacteristicProperties::WRITE;

        let transport = Arc::new(FakeTransport::new());
        transport.add_peripheral(
            FakePeripheral::new(ADDR).with_service(
                FakeService::new(SVC)
                    .with_characteristic(
                        FakeCharacteristic::new(DATA, readable_notify)
                            .with_value(vec![0xF0, 0x00, 0x00, 0x02])
                            .with_descriptor(CHARACTERISTIC_USER_DESCRIPTION_UUID, "IR Temp"),
                    )
                    .with_characteristic(
                        FakeCharacteristic::new(CONFIG, read_write).with_value(vec![0x00]),
                    )
                    .with_characteristic(FakeCharacteristic::new(
                        COMMAND,
                        CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                    ))
                    .with_characteristic(FakeCharacteristic::new(
                        STATUS,
                        CharacteristicProperties::INDICATE,
                    ))
                    .with_characteristic(
                        FakeCharacteristic::new(LEGACY, CharacteristicProperties::NOTIFY)
                            .without_descriptors(),
                    ),
            ),
        );

        let link = transport.link_connect(ADDR, AddressType::Public).await.unwrap();
        let catalog = GattCatalog::discover(transport.as_ref(), link, 1).await.unwrap();
        let (closed, closed_rx) = watch::channel(false);
        let io = AttributeIo::new(transport.clone(), ADDR, link, 1, closed_rx);

        Harness {
            transport,
            catalog,
            io,
            closed,
        }
    }

    #[tokio::test]
    async fn test_read_caches_value() {
        let h = harness().await;
        let data = h.characteristic(&DATA);

        let value = h.io.read((&data).into(), TIMEOUT).await.unwrap();
        assert_eq!(value, vec![0xF0, 0x00, 0x00, 0x02]);
        assert_eq!(data.cached_value(), Some(value));
    }

    #[tokio::test]
    async fn test_read_requires_permission() {
        let h = harness().await;
        let command = h.characteristic(&COMMAND);

        let err = h.io.read((&command).into(), TIMEOUT).await.unwrap_err();
        assert_eq!(
            err,
            Error::NotPermitted {
                operation: Operation::Read,
                uuid: COMMAND
            }
        );
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let h = harness().await;
        h.transport.set_read_delay(Duration::from_secs(5));
        let data = h.characteristic(&DATA);

        let err = h
            .io
            .read((&data).into(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout { operation: Operation::Read });
    }

    #[tokio::test]
    async fn test_write_picks_acknowledgment_from_properties() {
        let h = harness().await;
        let config = h.characteristic(&CONFIG);
        let command = h.characteristic(&COMMAND);

        h.io.write((&config).into(), &[0x01], TIMEOUT).await.unwrap();
        h.io.write((&command).into(), &[0x07], TIMEOUT).await.unwrap();
        h.io.write_without_response(&command, &[0x08], TIMEOUT).await.unwrap();

        let writes = h.transport.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes[0].ack_required);
        assert!(!writes[1].ack_required);
        assert!(!writes[2].ack_required);

        let read_back = h.io.read((&config).into(), TIMEOUT).await.unwrap();
        assert_eq!(read_back, vec![0x01]);
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let h = harness().await;
        let data = h.characteristic(&DATA);
        let config = h.characteristic(&CONFIG);

        assert!(matches!(
            h.io.write((&data).into(), &[1], TIMEOUT).await,
            Err(Error::NotPermitted { operation: Operation::Write, .. })
        ));
        assert!(matches!(
            h.io.write_without_response(&config, &[1], TIMEOUT).await,
            Err(Error::NotPermitted { .. })
        ));

        h.transport.set_max_attribute_len(4);
        assert!(matches!(
            h.io.write((&config).into(), &[0; 5], TIMEOUT).await,
            Err(Error::Transport { .. })
        ));
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledged_write_timeout() {
        let h = harness().await;
        h.transport.set_ack_delay(Duration::from_secs(5));
        let config = h.characteristic(&CONFIG);
        let command = h.characteristic(&COMMAND);

        let err = h
            .io
            .write((&config).into(), &[1], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout { operation: Operation::Write });

        // Unacknowledged writes do not wait for the peer.
        h.io.write_without_response(&command, &[1], Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_writes_cccd_once() {
        let h = harness().await;
        let data = h.characteristic(&DATA);
        let cccd = data.client_configuration().unwrap();

        let first = h.io.subscribe(&data, Arc::new(|_| {}), TIMEOUT).await.unwrap();
        let second = h.io.subscribe(&data, Arc::new(|_| {}), TIMEOUT).await.unwrap();
        assert_ne!(first, second);
        assert!(data.is_subscribed());

        let cccd_writes: Vec<_> = h
            .transport
            .writes()
            .into_iter()
            .filter(|w| w.attribute == cccd.handle())
            .collect();
        assert_eq!(cccd_writes.len(), 1);
        assert_eq!(cccd_writes[0].value, vec![0x01, 0x00]);

        h.io.unsubscribe(&data, first, TIMEOUT).await.unwrap();
        assert!(h.io.is_subscribed(&data));
        h.io.unsubscribe(&data, second, TIMEOUT).await.unwrap();
        assert!(!h.io.is_subscribed(&data));
        assert!(!data.is_subscribed());

        let last = h.transport.writes().pop().unwrap();
        assert_eq!(last.attribute, cccd.handle());
        assert_eq!(last.value, vec![0x00, 0x00]);

        // Idempotent.
        h.io.unsubscribe(&data, second, TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_indicate_only_uses_indication_value() {
        let h = harness().await;
        let status = h.characteristic(&STATUS);

        h.io.subscribe(&status, Arc::new(|_| {}), TIMEOUT).await.unwrap();
        let last = h.transport.writes().pop().unwrap();
        assert_eq!(last.value, vec![0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_subscribe_unsupported() {
        let h = harness().await;
        let config = h.characteristic(&CONFIG);
        assert!(matches!(
            h.io.subscribe(&config, Arc::new(|_| {}), TIMEOUT).await,
            Err(Error::NotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_notifications_delivered_in_order() {
        let h = harness().await;
        let data = h.characteristic(&DATA);
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.io.subscribe(
            &data,
            Arc::new(move |value| {
                let _ = tx.send(value);
            }),
            TIMEOUT,
        )
        .await
        .unwrap();

        for i in 0..10u8 {
            h.io.dispatch(data.handle(), Bytes::from(vec![i]));
        }

        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_link_loss_fails_pending_request() {
        let h = harness().await;
        h.transport.set_read_delay(Duration::from_secs(5));
        let data = h.characteristic(&DATA);

        let closed = h.closed;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closed.send_replace(true);
        });

        let err = h.io.read((&data).into(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_stale_attribute_is_not_found() {
        let h = harness().await;
        let link = h.transport.link_connect(ADDR, AddressType::Public).await.unwrap();
        let old = GattCatalog::discover(h.transport.as_ref(), link, 99).await.unwrap();
        let stale = old.characteristic(None, &DATA).unwrap();

        assert!(matches!(
            h.io.read((&stale).into(), TIMEOUT).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let h = harness().await;
        let data = h.characteristic(&DATA);
        h.io.subscribe(&data, Arc::new(|_| {}), TIMEOUT).await.unwrap();

        h.io.close();
        assert!(!data.is_subscribed());
        assert!(!h.io.is_subscribed(&data));
    }

    #[tokio::test]
    async fn test_read_descriptor() {
        let h = harness().await;
        let data = h.characteristic(&DATA);
        let description = data.descriptor(&CHARACTERISTIC_USER_DESCRIPTION_UUID).unwrap();

        let value = h.io.read((&description).into(), TIMEOUT).await.unwrap();
        assert_eq!(value, b"IR Temp".to_vec());
    }

    #[tokio::test]
    async fn test_read_sees_peer_side_updates() {
        let h = harness().await;
        let config = h.characteristic(&CONFIG);

        h.transport.set_value(ADDR, &CONFIG, vec![0x07]);
        assert_eq!(h.io.read((&config).into(), TIMEOUT).await.unwrap(), vec![0x07]);
        assert_eq!(config.cached_value(), Some(vec![0x07]));
    }

    #[tokio::test]
    async fn test_subscribe_without_configuration_descriptor() {
        let h = harness().await;
        let legacy = h.characteristic(&LEGACY);
        assert!(legacy.client_configuration().is_none());

        let err = h.io.subscribe(&legacy, Arc::new(|_| {}), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
        assert!(!legacy.is_subscribed());
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_close_during_subscribe_leaves_nothing_behind() {
        let Harness {
            transport,
            catalog,
            io,
            closed,
        } = harness().await;
        let closed = Arc::new(closed);
        {
            // The link drops while the peer acknowledges the CCCD write.
            let closed = closed.clone();
            transport.on_attribute_write(move |_| {
                closed.send_replace(true);
            });
        }
        let data = catalog.characteristic(None, &DATA).unwrap();

        let err = io.subscribe(&data, Arc::new(|_| {}), TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::Transport { .. }));
        assert!(!io.is_subscribed(&data));
        assert!(!data.is_subscribed());
        assert_eq!(transport.writes().len(), 1);
    }
}
