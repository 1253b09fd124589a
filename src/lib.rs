// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-gatt-client
//!
//! A cross-platform Bluetooth Low Energy central: discover peripherals,
//! connect to them, browse their GATT services and read, write or
//! subscribe to characteristics.
//!
//! ## Features
//!
//! - **Discovery**: Filtered scanning with a registry of seen devices
//! - **Connection Lifecycle**: Per-device state machine with joinable connects
//! - **Attribute Catalog**: Services, characteristics and descriptors after discovery
//! - **Attribute I/O**: Serialized reads and writes with deadlines
//! - **Notifications**: Callback or channel delivery, in arrival order
//! - **Pluggable Radio**: Any [`Transport`](transport::Transport); `btleplug` by default
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_gatt_client::sensortag::{self, IR_TEMPERATURE_DATA_UUID, IR_TEMPERATURE_SERVICE_UUID};
//! use ble_gatt_client::{DeviceFilter, DeviceManager, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new().await?;
//!     manager.start_discovery(None).await?;
//!
//!     let tag = manager
//!         .find(&DeviceFilter::by_name("SensorTag 2.0"), Duration::from_secs(10))
//!         .await?;
//!     manager.stop_discovery().await?;
//!
//!     tag.connect().await?;
//!     let data = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_DATA_UUID)?;
//!     let sample = sensortag::decode_ir_temperature(&tag.read(&data).await?)?;
//!     println!("Ambient: {:.1}°C", sample.ambient_celsius);
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types
//! - `fake-transport`: Export the in-memory [`FakeTransport`](transport::FakeTransport)

// Public modules
pub mod ble;
pub mod config;
pub mod device;
pub mod device_manager;
pub mod error;
pub mod sensortag;
pub mod transport;

// Re-exports for convenience
pub use config::EngineConfig;
pub use device::{CallbackHandle, Device, DeviceProperties};
pub use device_manager::DeviceManager;
pub use error::{Error, Operation, Result};

// Re-export commonly used types from submodules
pub use ble::address::{AddressType, BdAddr};
pub use ble::advertising::Advertisement;
pub use ble::catalog::{Characteristic, CharacteristicProperties, Descriptor, GattCatalog, Service};
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::io::ListenerId;
pub use ble::registry::DeviceFilter;
pub use ble::scanner::DiscoveryFilter;
pub use transport::{AdapterInfo, BtleplugTransport, Transport, TransportEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<Device>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<GattCatalog>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<DeviceFilter>();
        let _ = std::any::TypeId::of::<EngineConfig>();
    }

    #[test]
    fn test_address_roundtrip_through_reexport() {
        let addr: BdAddr = "B0:B4:48:C9:4B:01".parse().unwrap();
        assert_eq!(addr.to_string(), "B0:B4:48:C9:4B:01");
    }
}
