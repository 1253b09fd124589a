//! SensorTag IR temperature, polled
//!
//! Finds a TI SensorTag, enables its IR temperature sensor and reads the
//! data characteristic once a second.
//!
//! Run with: cargo run --example sensortag_poll
//!
//! To connect to a specific tag:
//!   cargo run --example sensortag_poll -- --address B0:B4:48:C9:4B:01

use ble_gatt_client::sensortag::{
    decode_ir_temperature, encode_period, IR_TEMPERATURE_CONFIG_UUID, IR_TEMPERATURE_DATA_UUID,
    IR_TEMPERATURE_PERIOD_UUID, IR_TEMPERATURE_SERVICE_UUID, SENSOR_DISABLE, SENSOR_ENABLE,
};
use ble_gatt_client::{BdAddr, DeviceFilter, DeviceManager, Result};
use std::time::Duration;

const SAMPLES: usize = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_gatt_client=info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.parse::<BdAddr>())
        .transpose()?;

    let filter = match address {
        Some(address) => DeviceFilter::by_address(address),
        None => DeviceFilter::by_name("SensorTag 2.0"),
    };

    let manager = DeviceManager::new().await?;
    manager.start_discovery(None).await?;

    println!("Looking for {}...", filter);
    let tag = manager.find(&filter, Duration::from_secs(30)).await?;
    manager.stop_discovery().await?;

    println!("Connecting to {} ({})...", tag.alias(), tag.address());
    tag.connect().await?;

    let catalog = tag.catalog()?;
    println!("Resolved {} service(s)", catalog.services().len());

    let config = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_CONFIG_UUID)?;
    let period = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_PERIOD_UUID)?;
    let data = tag.characteristic(&IR_TEMPERATURE_SERVICE_UUID, &IR_TEMPERATURE_DATA_UUID)?;

    tag.write(&config, &SENSOR_ENABLE).await?;
    tag.write(&period, &encode_period(Duration::from_secs(1))?).await?;

    for _ in 0..SAMPLES {
        tokio::time::sleep(Duration::from_secs(1)).await;

        match tag.read(&data).await.and_then(|v| decode_ir_temperature(&v)) {
            Ok(sample) => println!(
                "Object: {:6.2}°C  Ambient: {:6.2}°C",
                sample.object_celsius, sample.ambient_celsius
            ),
            Err(e) => println!("Read failed: {}", e),
        }
    }

    tag.write(&config, &SENSOR_DISABLE).await?;
    tag.disconnect().await?;

    manager.shutdown().await?;
    Ok(())
}
