//! TI SensorTag (CC2650) IR temperature service.
//!
//! The service exposes a data characteristic (object and ambient raw
//! temperatures), a configuration characteristic (write `0x01` to enable
//! the sensor) and a period characteristic (update interval in units of
//! 10 ms).

use uuid::Uuid;

use crate::error::{Error, Result};

/// IR temperature service UUID.
pub const IR_TEMPERATURE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);
/// IR temperature data characteristic UUID.
pub const IR_TEMPERATURE_DATA_UUID: Uuid = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);
/// IR temperature configuration characteristic UUID.
pub const IR_TEMPERATURE_CONFIG_UUID: Uuid =
    Uuid::from_u128(0xf000aa02_0451_4000_b000_000000000000);
/// IR temperature period characteristic UUID.
pub const IR_TEMPERATURE_PERIOD_UUID: Uuid =
    Uuid::from_u128(0xf000aa03_0451_4000_b000_000000000000);

/// Configuration value enabling the sensor.
pub const SENSOR_ENABLE: [u8; 1] = [0x01];
/// Configuration value disabling the sensor.
pub const SENSOR_DISABLE: [u8; 1] = [0x00];

/// Degrees Celsius per raw unit after the 2-bit shift (TMP007 LSB).
pub const SCALE_LSB: f32 = 0.03125;

/// One decoded IR temperature sample.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IrTemperature {
    /// Object (target) temperature in °C.
    pub object_celsius: f32,
    /// Ambient (die) temperature in °C.
    pub ambient_celsius: f32,
}

/// Convert a raw 16-bit sample to °C.
///
/// The low two bits are flags; dividing by 128 is the same as shifting
/// them out and scaling by [`SCALE_LSB`].
#[inline]
pub fn raw_to_celsius(raw: i16) -> f32 {
    f32::from(raw) / 128.0
}

/// Decode the 4-byte data characteristic (object LE, ambient LE).
///
/// # Errors
///
/// [`Error::InvalidData`] if the value is shorter than 4 bytes.
pub fn decode_ir_temperature(value: &[u8]) -> Result<IrTemperature> {
    if value.len() < 4 {
        return Err(Error::InvalidData {
            context: format!("IR temperature sample of {} bytes", value.len()),
        });
    }

    let object = i16::from_le_bytes([value[0], value[1]]);
    let ambient = i16::from_le_bytes([value[2], value[3]]);

    Ok(IrTemperature {
        object_celsius: raw_to_celsius(object),
        ambient_celsius: raw_to_celsius(ambient),
    })
}

/// Encode an update period for the period characteristic.
///
/// # Errors
///
/// [`Error::InvalidParameter`] outside the supported 300–2550 ms range.
pub fn encode_period(period: std::time::Duration) -> Result<[u8; 1]> {
    let units = period.as_millis() / 10;
    if !(30..=255).contains(&units) {
        return Err(Error::InvalidParameter {
            name: "period".to_string(),
            value: format!("{:?}", period),
        });
    }
    Ok([units as u8])
}
