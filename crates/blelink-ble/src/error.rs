//! Error types for the platform adapters

use blelink_core::LinkError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised while talking to the platform Bluetooth stack
#[derive(Error, Debug)]
pub enum BleAdapterError {
    #[error("Failed to create BLE manager: {0}")]
    ManagerInit(String),

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to power on adapter: {0}")]
    PowerOn(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Failed to start BLE scan: {0}")]
    ScanFailed(String),

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to register GATT application: {0}")]
    GattRegistration(String),

    #[error("Failed to start advertising: {0}")]
    AdvertisingFailed(String),

    #[error("{0} role not supported in this build")]
    Unsupported(&'static str),
}

impl From<BleAdapterError> for LinkError {
    fn from(err: BleAdapterError) -> Self {
        match err {
            BleAdapterError::ScanFailed(reason) => LinkError::ScanFailed(reason),
            BleAdapterError::DeviceNotFound { address } => LinkError::ConnectionFailed {
                address,
                reason: "device not found".to_string(),
            },
            BleAdapterError::AdvertisingFailed(reason) => LinkError::AdvertisingFailed(reason),
            BleAdapterError::GattRegistration(reason) => LinkError::GattServer(reason),
            BleAdapterError::Unsupported("peripheral") => LinkError::AdvertisingUnsupported,
            other => LinkError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_meaning() {
        let err: LinkError = BleAdapterError::DeviceNotFound {
            address: "AA:BB".to_string(),
        }
        .into();
        assert!(matches!(err, LinkError::ConnectionFailed { ref address, .. } if address == "AA:BB"));

        let err: LinkError = BleAdapterError::Unsupported("peripheral").into();
        assert!(matches!(err, LinkError::AdvertisingUnsupported));

        let err: LinkError = BleAdapterError::ConnectionTimeout.into();
        assert_eq!(err.to_string(), "Transport error: Connection timeout");
    }
}
