//! Well-known GATT UUIDs and UUID text helpers.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Bluetooth Base UUID; 16- and 32-bit assigned numbers are offsets into it.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

// Generic Access / Generic Attribute
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = uuid_from_u16(0x1800);
/// Generic Attribute service UUID.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = uuid_from_u16(0x1801);
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = uuid_from_u16(0x2a00);
/// Appearance characteristic UUID.
pub const APPEARANCE_UUID: Uuid = uuid_from_u16(0x2a01);

// Device Information Service
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Model Number characteristic UUID.
pub const MODEL_NUMBER_UUID: Uuid = uuid_from_u16(0x2a24);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);
/// PnP ID characteristic UUID (vendor/product/version).
pub const PNP_ID_UUID: Uuid = uuid_from_u16(0x2a50);

// Battery Service
/// Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);

// Descriptors
/// Characteristic Extended Properties descriptor UUID.
pub const CHARACTERISTIC_EXTENDED_PROPERTIES_UUID: Uuid = uuid_from_u16(0x2900);
/// Characteristic User Description descriptor UUID.
pub const CHARACTERISTIC_USER_DESCRIPTION_UUID: Uuid = uuid_from_u16(0x2901);
/// Client Characteristic Configuration descriptor UUID (enables notify/indicate).
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid = uuid_from_u16(0x2902);

/// Expand a 16-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// The 16-bit short form, if `uuid` lies on the Bluetooth Base UUID.
pub fn to_short_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask = (1u128 << 96) - 1;
    if value & base_mask != BLUETOOTH_BASE_UUID.as_u128() {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Canonical text form: lower-case, hyphenated.
pub fn canonical(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}

/// Parse a UUID in full form or as a 16/32-bit short form (`"2902"`,
/// `"0x2902"`, `"0000180a"`).
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let invalid = || Error::InvalidParameter {
        name: "uuid".to_string(),
        value: s.to_string(),
    };

    match digits.len() {
        4 => u16::from_str_radix(digits, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(digits, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}
