//! Engine configuration.
//!
//! Every suspending operation has a deadline; the defaults live here and can
//! be overridden per call through the `*_with_timeout` variants.

use std::time::Duration;

/// Tunables shared by all devices of one [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Deadline for establishing the transport link.
    pub connect_timeout: Duration,
    /// Deadline for enumerating the attribute table after link-up.
    pub discovery_timeout: Duration,
    /// Default deadline for a single read or write.
    pub io_timeout: Duration,
    /// Deadline for tearing down the link.
    pub disconnect_timeout: Duration,
    /// Deadline for a pairing exchange.
    pub pairing_timeout: Duration,
    /// Devices not seen for this long are evicted. `None` disables ageing.
    pub device_ttl: Option<Duration>,
    /// How often the registry is swept for stale devices.
    pub stale_check_interval: Duration,
    /// Capacity of the broadcast channels used for events.
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default I/O timeout (5 seconds).
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the default read/write timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the pairing timeout.
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    /// Set the device time-to-live used for registry ageing.
    pub fn with_device_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.device_ttl = ttl;
        self
    }

    /// Set the interval of the stale-device sweep.
    pub fn with_stale_check_interval(mut self, interval: Duration) -> Self {
        self.stale_check_interval = interval;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: Duration::from_secs(30),
            io_timeout: Self::DEFAULT_IO_TIMEOUT,
            disconnect_timeout: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(30),
            device_ttl: Some(Duration::from_secs(180)),
            stale_check_interval: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(5));
        assert_eq!(config.device_ttl, Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_io_timeout(Duration::from_millis(250))
            .with_device_ttl(None);
        assert_eq!(config.io_timeout, Duration::from_millis(250));
        assert!(config.device_ttl.is_none());
        assert_eq!(config.connect_timeout, EngineConfig::DEFAULT_CONNECT_TIMEOUT);
    }
}
