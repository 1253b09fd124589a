//! Advertising data.
//!
//! An [`Advertisement`] is one sighting of a peripheral as reported by the
//! transport. Transports that hand over the raw advertising payload can use
//! [`Advertisement::parse`] to decode the AD structures; others fill the
//! fields directly.

use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddr};
use crate::ble::uuids::{uuid_from_u16, uuid_from_u32};
use crate::error::{Error, Result};

/// AD type codes from the Bluetooth Core Specification Supplement.
mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID32: u8 = 0x04;
    pub const COMPLETE_UUID32: u8 = 0x05;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const SHORTENED_NAME: u8 = 0x08;
    pub const COMPLETE_NAME: u8 = 0x09;
    pub const TX_POWER: u8 = 0x0A;
    pub const CLASS_OF_DEVICE: u8 = 0x0D;
    pub const SERVICE_DATA_UUID16: u8 = 0x16;
    pub const APPEARANCE: u8 = 0x19;
    pub const SERVICE_DATA_UUID32: u8 = 0x20;
    pub const SERVICE_DATA_UUID128: u8 = 0x21;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// One advertisement (or scan response) seen from a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Address of the advertiser.
    pub address: BdAddr,
    /// Address type of the advertiser.
    pub address_type: AddressType,
    /// Local name, complete or shortened.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised TX power level in dBm.
    pub tx_power: Option<i16>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// GAP appearance value.
    pub appearance: Option<u16>,
    /// Class of device (24 bits).
    pub class: Option<u32>,
    /// AD flags byte.
    pub flags: Option<u8>,
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// The raw payload, empty when the transport does not provide it.
    pub payload: Bytes,
}

impl Advertisement {
    /// Create an advertisement carrying only an address.
    pub fn new(address: BdAddr, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
            ..Default::default()
        }
    }

    /// Set the local name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the advertised service UUIDs.
    pub fn with_service_uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.service_uuids = uuids.into_iter().collect();
        self
    }

    /// Decode a raw advertising payload.
    ///
    /// The payload is a sequence of `length | type | data` structures. A zero
    /// length byte terminates the significant part early.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] if a structure overruns the payload or
    /// a fixed-size field has the wrong length.
    pub fn parse(
        address: BdAddr,
        address_type: AddressType,
        rssi: Option<i16>,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload: Bytes = payload.into();
        let mut adv = Self::new(address, address_type);
        adv.rssi = rssi;

        let mut offset = 0;
        while offset < payload.len() {
            let len = payload[offset] as usize;
            if len == 0 {
                break;
            }
            let end = offset + 1 + len;
            if end > payload.len() {
                return Err(Error::InvalidData {
                    context: format!(
                        "AD structure at offset {} overruns payload ({} > {})",
                        offset,
                        end,
                        payload.len()
                    ),
                });
            }
            let kind = payload[offset + 1];
            let data = &payload[offset + 2..end];
            adv.apply_structure(kind, data)?;
            offset = end;
        }

        adv.payload = payload;
        Ok(adv)
    }

    fn apply_structure(&mut self, kind: u8, data: &[u8]) -> Result<()> {
        match kind {
            ad_type::FLAGS => {
                self.flags = data.first().copied();
            }
            ad_type::INCOMPLETE_UUID16 | ad_type::COMPLETE_UUID16 => {
                for chunk in exact_chunks(data, 2, "16-bit UUID list")? {
                    self.push_uuid(uuid_from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            ad_type::INCOMPLETE_UUID32 | ad_type::COMPLETE_UUID32 => {
                for chunk in exact_chunks(data, 4, "32-bit UUID list")? {
                    let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    self.push_uuid(uuid_from_u32(short));
                }
            }
            ad_type::INCOMPLETE_UUID128 | ad_type::COMPLETE_UUID128 => {
                for chunk in exact_chunks(data, 16, "128-bit UUID list")? {
                    self.push_uuid(uuid_from_le_slice(chunk));
                }
            }
            ad_type::SHORTENED_NAME => {
                // A complete name always wins over a shortened one.
                if self.name.is_none() {
                    self.name = Some(String::from_utf8_lossy(data).into_owned());
                }
            }
            ad_type::COMPLETE_NAME => {
                self.name = Some(String::from_utf8_lossy(data).into_owned());
            }
            ad_type::TX_POWER => {
                let byte = fixed::<1>(data, "TX power")?;
                self.tx_power = Some(byte[0] as i8 as i16);
            }
            ad_type::CLASS_OF_DEVICE => {
                let b = fixed::<3>(data, "class of device")?;
                self.class = Some(u32::from_le_bytes([b[0], b[1], b[2], 0]));
            }
            ad_type::APPEARANCE => {
                let b = fixed::<2>(data, "appearance")?;
                self.appearance = Some(u16::from_le_bytes(b));
            }
            ad_type::SERVICE_DATA_UUID16 => {
                let (uuid, rest) = split_service_data(data, 2)?;
                self.service_data.insert(uuid, rest.to_vec());
            }
            ad_type::SERVICE_DATA_UUID32 => {
                let (uuid, rest) = split_service_data(data, 4)?;
                self.service_data.insert(uuid, rest.to_vec());
            }
            ad_type::SERVICE_DATA_UUID128 => {
                let (uuid, rest) = split_service_data(data, 16)?;
                self.service_data.insert(uuid, rest.to_vec());
            }
            ad_type::MANUFACTURER_DATA => {
                if data.len() < 2 {
                    return Err(Error::InvalidData {
                        context: "manufacturer data shorter than company identifier".to_string(),
                    });
                }
                let company = u16::from_le_bytes([data[0], data[1]]);
                self.manufacturer_data.insert(company, data[2..].to_vec());
            }
            _ => {}
        }
        Ok(())
    }

    fn push_uuid(&mut self, uuid: Uuid) {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
    }
}

fn exact_chunks<'a>(
    data: &'a [u8],
    size: usize,
    what: &str,
) -> Result<std::slice::ChunksExact<'a, u8>> {
    if data.len() % size != 0 {
        return Err(Error::InvalidData {
            context: format!("{} has length {} (not a multiple of {})", what, data.len(), size),
        });
    }
    Ok(data.chunks_exact(size))
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| Error::InvalidData {
        context: format!("{} has length {}, expected {}", what, data.len(), N),
    })
}

fn split_service_data(data: &[u8], uuid_len: usize) -> Result<(Uuid, &[u8])> {
    if data.len() < uuid_len {
        return Err(Error::InvalidData {
            context: format!("service data shorter than its {}-byte UUID", uuid_len),
        });
    }
    let (raw, rest) = data.split_at(uuid_len);
    let uuid = match uuid_len {
        2 => uuid_from_u16(u16::from_le_bytes([raw[0], raw[1]])),
        4 => uuid_from_u32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        _ => uuid_from_le_slice(raw),
    };
    Ok((uuid, rest))
}

/// 128-bit UUIDs travel little-endian over the air.
fn uuid_from_le_slice(raw: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    for (dst, src) in bytes.iter_mut().zip(raw.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(bytes)
}
