//! The radio seam.
//!
//! Everything the engine needs from a Bluetooth stack goes through the
//! [`Transport`] trait: scanning, link management and raw attribute
//! protocol requests. Unsolicited traffic (advertisements, value changes,
//! link loss) arrives on the broadcast channel returned by
//! [`Transport::events`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddr};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::CharacteristicProperties;
use crate::ble::scanner::DiscoveryFilter;
use crate::error::{Error, Result};

pub mod btleplug_backend;
#[cfg(any(test, feature = "fake-transport"))]
pub mod fake;

pub use self::btleplug_backend::BtleplugTransport;
#[cfg(any(test, feature = "fake-transport"))]
pub use self::fake::{FakeCharacteristic, FakePeripheral, FakeService, FakeTransport, RecordedWrite};

/// Default maximum attribute value length (ATT_MTU independent limit).
pub const DEFAULT_MAX_ATTRIBUTE_LEN: usize = 512;

/// Opaque identifier of one established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u64);

impl std::fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Attribute handle within one link's attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle(pub u16);

impl std::fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Identity of the local radio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdapterInfo {
    /// Platform identifier of the adapter (e.g. `hci0`).
    pub identifier: String,
    /// Whether the radio is powered.
    pub powered: bool,
    /// Whether the adapter is discoverable by other devices.
    pub discoverable: bool,
    /// Whether a discovery session is active.
    pub discovering: bool,
}

/// A primary or secondary service as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Declaration handle.
    pub handle: AttributeHandle,
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

/// A characteristic as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    /// Value handle used for reads, writes and notifications.
    pub handle: AttributeHandle,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Declared capabilities.
    pub properties: CharacteristicProperties,
}

/// A descriptor as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDefinition {
    /// Descriptor handle.
    pub handle: AttributeHandle,
    /// Descriptor UUID.
    pub uuid: Uuid,
}

/// Unsolicited traffic from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement or scan response was received.
    AdvertisementSeen(Advertisement),
    /// A notification or indication arrived on a link.
    ValueChanged {
        /// The link it arrived on.
        link: LinkHandle,
        /// Value handle of the characteristic.
        attribute: AttributeHandle,
        /// The new value.
        value: Bytes,
    },
    /// A link dropped without being asked to.
    LinkLost {
        /// The lost link.
        link: LinkHandle,
        /// Human-readable reason.
        reason: String,
    },
}

/// Access to one physical or virtual radio.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Describe the adapter.
    async fn adapter_info(&self) -> Result<AdapterInfo>;

    /// Subscribe to unsolicited transport events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Start scanning. The filter's service UUIDs may be used as a hint.
    async fn scan_start(&self, filter: &DiscoveryFilter) -> Result<()>;

    /// Stop scanning.
    async fn scan_stop(&self) -> Result<()>;

    /// Establish a link to a peripheral.
    async fn link_connect(&self, address: BdAddr, address_type: AddressType) -> Result<LinkHandle>;

    /// Tear a link down.
    async fn link_disconnect(&self, link: LinkHandle) -> Result<()>;

    /// Enumerate the services of a linked peripheral.
    async fn discover_services(&self, link: LinkHandle) -> Result<Vec<ServiceDefinition>>;

    /// Enumerate the characteristics of one service.
    async fn discover_characteristics(
        &self,
        link: LinkHandle,
        service: AttributeHandle,
    ) -> Result<Vec<CharacteristicDefinition>>;

    /// Enumerate the descriptors of one characteristic.
    async fn discover_descriptors(
        &self,
        link: LinkHandle,
        characteristic: AttributeHandle,
    ) -> Result<Vec<DescriptorDefinition>>;

    /// Read an attribute value.
    async fn attribute_read(&self, link: LinkHandle, attribute: AttributeHandle) -> Result<Vec<u8>>;

    /// Write an attribute value. With `ack_required == false` this resolves
    /// as soon as the packet was handed to the radio.
    async fn attribute_write(
        &self,
        link: LinkHandle,
        attribute: AttributeHandle,
        value: Vec<u8>,
        ack_required: bool,
    ) -> Result<()>;

    /// Largest value accepted by `attribute_write` on this link.
    fn max_attribute_len(&self, _link: LinkHandle) -> usize {
        DEFAULT_MAX_ATTRIBUTE_LEN
    }

    /// Run a pairing exchange on an established link.
    async fn pair(&self, _link: LinkHandle) -> Result<()> {
        Err(Error::NotSupported {
            operation: "pairing".to_string(),
        })
    }

    /// Abort an outstanding pairing exchange.
    async fn cancel_pairing(&self, _link: LinkHandle) -> Result<()> {
        Ok(())
    }
}
