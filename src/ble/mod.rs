//! BLE central building blocks.
//!
//! Addresses and advertisements, discovery, the device registry, the
//! per-device connection state machine, the GATT attribute catalog and
//! attribute I/O.

pub mod address;
pub mod advertising;
pub mod catalog;
pub mod connection;
pub mod io;
pub mod registry;
pub mod scanner;
pub mod uuids;

pub use address::{AddressType, BdAddr};
pub use advertising::Advertisement;
pub use catalog::{
    AttributeRef, Characteristic, CharacteristicProperties, Descriptor, GattCatalog, Service,
};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use io::{Listener, ListenerId};
pub use registry::{DeviceFilter, DeviceRegistry};
pub use scanner::{DiscoveryController, DiscoveryFilter};
pub use uuids::*;
