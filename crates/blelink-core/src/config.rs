//! Link configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::protocol::READY_RESPONSE;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Timing and capacity settings shared by both link roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Period of the central's scan-and-reconnect loop
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Length of each discovery scan started by the reconnect loop
    #[serde(with = "duration_ms")]
    pub scan_duration: Duration,
    /// Delay between `send_message` and the actual characteristic write
    #[serde(with = "duration_ms")]
    pub write_delay: Duration,
    /// Number of peers kept in the recent-peer directory
    pub recent_peer_capacity: usize,
    /// Value returned to centrals that read the write characteristic
    pub ready_response: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(25),
            scan_duration: Duration::from_secs(5),
            write_delay: Duration::from_millis(500),
            recent_peer_capacity: 5,
            ready_response: READY_RESPONSE.to_string(),
        }
    }
}

impl LinkConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconnect loop period
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the per-attempt scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set the outbound write delay
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Set the recent-peer directory capacity
    pub fn with_recent_peer_capacity(mut self, capacity: usize) -> Self {
        self.recent_peer_capacity = capacity;
        self
    }

    /// Set the read-probe response string
    pub fn with_ready_response(mut self, response: impl Into<String>) -> Self {
        self.ready_response = response.into();
        self
    }

    /// Reject settings that would make the links misbehave
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_interval.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "Reconnect interval must be greater than 0".to_string(),
            ));
        }
        if self.scan_duration.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "Scan duration must be greater than 0".to_string(),
            ));
        }
        if self.scan_duration > self.reconnect_interval {
            return Err(LinkError::InvalidConfiguration(format!(
                "Scan duration ({} ms) must not exceed the reconnect interval ({} ms)",
                self.scan_duration.as_millis(),
                self.reconnect_interval.as_millis()
            )));
        }
        if self.recent_peer_capacity == 0 {
            return Err(LinkError::InvalidConfiguration(
                "Recent peer capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durations stored as integer milliseconds, for `#[serde(with = ...)]`
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = LinkConfig::default();
        assert_eq!(config.reconnect_interval, Duration::from_secs(25));
        assert_eq!(config.scan_duration, Duration::from_secs(5));
        assert_eq!(config.write_delay, Duration::from_millis(500));
        assert_eq!(config.recent_peer_capacity, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_scan_longer_than_interval() {
        let config = LinkConfig::new()
            .with_reconnect_interval(Duration::from_secs(2))
            .with_scan_duration(Duration::from_secs(3));
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(LinkConfig::default()).unwrap();
        assert_eq!(json["reconnect_interval"], 25_000);
        assert_eq!(json["write_delay"], 500);

        let parsed: LinkConfig =
            serde_json::from_str(r#"{"scan_duration": 1500, "recent_peer_capacity": 3}"#).unwrap();
        assert_eq!(parsed.scan_duration, Duration::from_millis(1500));
        assert_eq!(parsed.recent_peer_capacity, 3);
        assert_eq!(parsed.reconnect_interval, Duration::from_secs(25));
    }
}
