//! Error types for the link core
//!
//! Transport primitives and the persistence surface report failures through
//! [`LinkError`]. The links themselves never hand these to their caller: every
//! failure ends in a host log line plus either a state reset or a scheduled
//! retry.

use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by transport primitives, storage and configuration
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: Uuid },

    #[error("Not connected")]
    NotConnected,

    #[error("BLE advertising not supported on this device")]
    AdvertisingUnsupported,

    #[error("Advertising failed: {0}")]
    AdvertisingFailed(String),

    #[error("GATT server error: {0}")]
    GattServer(String),

    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Shorthand for a free-form transport failure
    pub fn transport(reason: impl Into<String>) -> Self {
        LinkError::Transport(reason.into())
    }
}

/// Result type used by transports and storage
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let err = LinkError::ConnectionFailed {
            address: "X".to_string(),
            reason: "device unreachable".to_string(),
        };
        assert_eq!(err.to_string(), "Connection to X failed: device unreachable");
        assert_eq!(
            LinkError::transport("handle already released").to_string(),
            "Transport error: handle already released"
        );

        let io: LinkError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(io, LinkError::Io(_)));
    }
}
