//! Simulated SensorTag session
//!
//! Runs the full discover / connect / subscribe flow against the in-memory
//! transport, so it works without a Bluetooth adapter.
//!
//! Run with: cargo run --example simulated_sensortag --features fake-transport

use ble_gatt_client::ble::uuids::DEVICE_INFO_SERVICE_UUID;
use ble_gatt_client::sensortag::{
    decode_ir_temperature, IR_TEMPERATURE_CONFIG_UUID, IR_TEMPERATURE_DATA_UUID,
    IR_TEMPERATURE_SERVICE_UUID, SENSOR_ENABLE,
};
use ble_gatt_client::transport::{FakeCharacteristic, FakePeripheral, FakeService, FakeTransport};
use ble_gatt_client::{
    BdAddr, CharacteristicProperties, DeviceFilter, DeviceManager, EngineConfig, Result,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_gatt_client=debug")
        .init();

    let address: BdAddr = "B0:B4:48:C9:4B:01".parse()?;
    let transport = Arc::new(FakeTransport::new());
    transport.add_peripheral(
        FakePeripheral::new(address)
            .with_name("SensorTag 2.0")
            .with_rssi(-58)
            .with_service(FakeService::new(DEVICE_INFO_SERVICE_UUID))
            .with_service(
                FakeService::new(IR_TEMPERATURE_SERVICE_UUID)
                    .with_characteristic(
                        FakeCharacteristic::new(
                            IR_TEMPERATURE_DATA_UUID,
                            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                        )
                        .with_value([0x00, 0x0C, 0x00, 0x0B]),
                    )
                    .with_characteristic(
                        FakeCharacteristic::new(
                            IR_TEMPERATURE_CONFIG_UUID,
                            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                        )
                        .with_value([0x00]),
                    ),
            ),
    );

    let manager = DeviceManager::with_transport(transport.clone(), EngineConfig::default()).await?;
    manager.start_discovery(None).await?;
    transport.advertise(address);

    let tag = manager
        .find(&DeviceFilter::by_name("SensorTag 2.0"), Duration::from_secs(1))
        .await?;
    manager.stop_discovery().await?;

    tag.connect().await?;
    for service in tag.services()? {
        println!("Service {}", service.uuid());
        for characteristic in service.characteristics() {
            println!(
                "  Characteristic {} {:?}",
                characteristic.uuid(),
                characteristic.properties()
            );
        }
    }

    let config = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_CONFIG_UUID)?;
    let data = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_DATA_UUID)?;
    tag.write(&config, &SENSOR_ENABLE).await?;

    let sample = decode_ir_temperature(&tag.read(&data).await?)?;
    println!("Read: ambient {:.2}°C", sample.ambient_celsius);

    let (listener, mut rx) = tag.subscribe_channel(&data).await?;
    for raw in [0x0C00i16, 0x0C40, 0x0C80] {
        let mut value = raw.to_le_bytes().to_vec();
        value.extend_from_slice(&0x0B00i16.to_le_bytes());
        transport.notify(address, &IR_TEMPERATURE_DATA_UUID, value);
    }

    for _ in 0..3 {
        if let Some(value) = rx.recv().await {
            let sample = decode_ir_temperature(&value)?;
            println!("Notified: object {:.2}°C", sample.object_celsius);
        }
    }

    tag.unsubscribe(&data, listener).await?;
    tag.disconnect().await?;
    manager.shutdown().await?;
    Ok(())
}
