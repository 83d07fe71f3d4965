//! Protocol and link configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::packet::{DEFAULT_MTU, MAX_PENDING_REASSEMBLY, REASSEMBLY_TIMEOUT};
use crate::wire::MAX_PAYLOAD_SIZE;

/// Session engine configuration
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Pending initiator handshakes older than this are abandoned
    pub handshake_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ProtocolConfig {
    /// Period of the expired-handshake sweep: half the handshake timeout.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.handshake_timeout / 2
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "handshake_timeout",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

/// Link adapter configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Maximum data bytes per link packet
    pub mtu: usize,
    /// Incomplete reassemblies older than this are discarded
    pub reassembly_timeout: Duration,
    /// Maximum seq values awaiting reassembly per connection
    pub max_pending_reassembly: usize,
    /// Time a fresh inbound connection has to deliver its HANDSHAKE frame
    pub first_frame_timeout: Duration,
    /// Maximum concurrent inbound connections
    pub max_inbound_connections: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            reassembly_timeout: REASSEMBLY_TIMEOUT,
            max_pending_reassembly: MAX_PENDING_REASSEMBLY,
            first_frame_timeout: Duration::from_secs(10),
            max_inbound_connections: 128,
        }
    }
}

impl LinkConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A packet header plus one MTU of data must fit in one wire envelope
        if self.mtu == 0 || self.mtu > MAX_PAYLOAD_SIZE - crate::packet::HEADER_SIZE {
            return Err(ConfigError::Invalid {
                field: "mtu",
                reason: "must be between 1 and the wire payload limit",
            });
        }
        if self.reassembly_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "reassembly_timeout",
                reason: "must be greater than zero",
            });
        }
        if self.max_pending_reassembly == 0 {
            return Err(ConfigError::Invalid {
                field: "max_pending_reassembly",
                reason: "must be greater than zero",
            });
        }
        if self.first_frame_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "first_frame_timeout",
                reason: "must be greater than zero",
            });
        }
        if self.max_inbound_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_inbound_connections",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_link_defaults_validate() {
        let config = LinkConfig::default();
        assert_eq!(config.mtu, 65_536);
        assert_eq!(config.max_pending_reassembly, 64);
        assert_eq!(config.max_inbound_connections, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_link_validate_rejects_zero_values() {
        let config = LinkConfig {
            mtu: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "mtu", .. })
        ));

        let config = LinkConfig {
            max_inbound_connections: 0,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ProtocolConfig {
            handshake_timeout: Duration::ZERO,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_link_validate_rejects_oversized_mtu() {
        let config = LinkConfig {
            mtu: MAX_PAYLOAD_SIZE,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
