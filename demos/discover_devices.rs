//! Basic example: Discover nearby BLE peripherals
//!
//! Run with: cargo run --example discover_devices
//!
//! To only report devices advertising a service:
//!   cargo run --example discover_devices -- --service 180f

use ble_gatt_client::ble::uuids::parse_uuid;
use ble_gatt_client::{DeviceManager, DiscoveryFilter, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_gatt_client=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let service = args
        .iter()
        .position(|arg| arg == "--service")
        .and_then(|i| args.get(i + 1))
        .map(|s| parse_uuid(s))
        .transpose()?;

    println!("Starting BLE discovery...\n");

    let manager = DeviceManager::new().await?;
    let adapter = manager.adapter_info().await?;
    println!("Adapter: {} (powered: {})\n", adapter.identifier, adapter.powered);

    let _handle = manager.on_device_discovered(|device| {
        println!(
            "  {} {:<24} RSSI: {:?} dBm",
            device.address(),
            device.alias(),
            device.rssi()
        );
    });

    let filter = service.map(|uuid| DiscoveryFilter::new().with_service_uuid(uuid));
    manager.start_discovery(filter).await?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    manager.stop_discovery().await?;

    println!("\n=== Discovered {} device(s) ===", manager.device_count());
    for device in manager.devices_by_signal() {
        let props = device.properties();
        println!("{} ({})", props.alias(), props.address);
        if let Some(rssi) = props.rssi {
            println!("  RSSI: {} dBm", rssi);
        }
        if let Some(icon) = props.icon() {
            println!("  Icon: {}", icon);
        }
        for uuid in &props.service_uuids {
            println!("  Service: {}", uuid);
        }
        for (company, data) in &props.manufacturer_data {
            println!("  Manufacturer {:#06x}: {:02x?}", company, data);
        }
    }

    manager.shutdown().await?;
    Ok(())
}
