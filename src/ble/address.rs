//! Bluetooth device addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A 6-byte Bluetooth device address.
///
/// Bytes are stored most-significant first, matching the textual form
/// `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Create an address from its six bytes (most-significant first).
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The raw address bytes.
    pub const fn into_bytes(self) -> [u8; 6] {
        self.0
    }

    /// Address formatted with `-` separators, used as the fallback alias.
    pub fn dashed(&self) -> String {
        self.to_string().replace(':', "-")
    }
}

impl From<[u8; 6]> for BdAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter {
            name: "address".to_string(),
            value: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for BdAddr {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for BdAddr {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address type of an LE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    /// IEEE-assigned public address.
    #[default]
    Public,
    /// Random (static or private) address.
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Random => write!(f, "random"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: BdAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.into_bytes(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.dashed(), "AA-BB-CC-DD-EE-FF");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "AA:BB:CC:DD:EE",
            "AA:BB:CC:DD:EE:FF:00",
            "AA:BB:CC:DD:EE:F",
            "AA:BB:CC:DD:EE:GG",
            "AABBCCDDEEFF",
            "AA:BB:CC:DD:EE:+F",
            "AA:BB:CC:DD:+E:FF",
        ] {
            assert!(bad.parse::<BdAddr>().is_err(), "accepted {bad:?}");
        }
    }
}
