//! Platform adapter configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Settings shared by the platform adapters
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleAdapterConfig {
    /// Maximum time to wait for a connection to come up
    #[serde(with = "blelink_core::config::duration_ms")]
    pub connection_timeout: Duration,
    /// Maximum time a GATT request waits for the link to answer it
    #[serde(with = "blelink_core::config::duration_ms")]
    pub response_timeout: Duration,
    /// Which local adapter to use, in the order the platform lists them
    pub adapter_index: usize,
}

impl Default for BleAdapterConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
            adapter_index: 0,
        }
    }
}

impl BleAdapterConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set how long GATT requests wait for an answer
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Select a local adapter by position
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }
}
