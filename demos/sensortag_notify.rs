//! SensorTag IR temperature, notified
//!
//! Same as `sensortag_poll` but subscribes to the data characteristic and
//! prints samples as they arrive. Falls back to polling on firmware that
//! does not notify the data characteristic.
//!
//! Run with: cargo run --example sensortag_notify

use ble_gatt_client::sensortag::{
    decode_ir_temperature, IR_TEMPERATURE_CONFIG_UUID, IR_TEMPERATURE_DATA_UUID,
    IR_TEMPERATURE_SERVICE_UUID, SENSOR_DISABLE, SENSOR_ENABLE,
};
use ble_gatt_client::{ConnectionState, DeviceFilter, DeviceManager, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_gatt_client=info")
        .init();

    let manager = DeviceManager::new().await?;
    manager.start_discovery(None).await?;

    let tag = manager
        .find(
            &DeviceFilter::by_service(IR_TEMPERATURE_SERVICE_UUID).with_name("SensorTag 2.0"),
            Duration::from_secs(30),
        )
        .await?;
    manager.stop_discovery().await?;

    let _state_handle = tag.on_connection_state_changed(|state| {
        if state == ConnectionState::Disconnected {
            println!("Link dropped");
        }
    });

    tag.connect().await?;

    let config = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_CONFIG_UUID)?;
    let data = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_DATA_UUID)?;

    tag.write(&config, &SENSOR_ENABLE).await?;

    if !data.properties().can_subscribe() {
        println!("Data characteristic does not notify, polling instead");
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            print_sample(&tag.read(&data).await?);
        }
    } else {
        let listener = tag.subscribe(&data, |value| print_sample(&value)).await?;

        println!("Listening for 30 seconds (Ctrl+C to stop)...");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }

        tag.unsubscribe(&data, listener).await?;
    }

    tag.write(&config, &SENSOR_DISABLE).await?;
    tag.disconnect().await?;

    manager.shutdown().await?;
    Ok(())
}

fn print_sample(value: &[u8]) {
    match decode_ir_temperature(value) {
        Ok(sample) => println!(
            "Object: {:6.2}°C  Ambient: {:6.2}°C",
            sample.object_celsius, sample.ambient_celsius
        ),
        Err(e) => println!("Bad sample: {}", e),
    }
}
