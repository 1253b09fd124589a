//! Error types for the ble-gatt-client crate.

use thiserror::Error;
use uuid::Uuid;

/// Operation that can exceed its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// Establishing the transport link.
    Connect,
    /// Tearing down the transport link.
    Disconnect,
    /// Enumerating services, characteristics and descriptors.
    ServiceDiscovery,
    /// Attribute read.
    Read,
    /// Attribute write.
    Write,
    /// Client configuration write for notifications/indications.
    Subscribe,
    /// Pairing exchange.
    Pair,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::ServiceDiscovery => write!(f, "service discovery"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Pair => write!(f, "pair"),
        }
    }
}

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A device or attribute lookup failed.
    #[error("Not found: {what}")]
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timed out during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: Operation,
    },

    /// A connection attempt or session already exists for the device.
    #[error("Connection already in progress for {address}")]
    AlreadyInProgress {
        /// Address of the device.
        address: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// The attribute lacks the capability for the requested operation.
    #[error("Operation {operation} not permitted on {uuid}")]
    NotPermitted {
        /// The rejected operation.
        operation: Operation,
        /// UUID of the attribute.
        uuid: Uuid,
    },

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The underlying link or radio failed.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The attribute table could not be fully enumerated.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// Invalid data was received or supplied.
    #[error("Invalid data: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => Self::BluetoothUnavailable,
            btleplug::Error::DeviceNotFound => Self::not_found("peripheral"),
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::NotSupported(operation) => Self::NotSupported { operation },
            btleplug::Error::TimedOut(_) => Self::transport("radio operation timed out"),
            other => Self::transport(other.to_string()),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
