//! Platform BLE adapters for the blelink link core
//!
//! `blelink-core` drives both roles through the transport traits in
//! [`blelink_core::transport`]. This crate implements them on real radios:
//!
//! - `central` feature: [`BtleplugCentral`] scans and connects through btleplug
//! - `peripheral` feature (Linux): `BluezPeripheral` advertises and serves the
//!   message service through BlueZ
//!
//! Both features link against the system D-Bus library on Linux, so they are
//! off by default. Without them the constructors below still work and hand
//! back transports that report the role as unavailable.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blelink_ble::{platform_central, platform_peripheral, BleAdapterConfig};
//!
//! # async fn example() -> Result<(), blelink_ble::BleAdapterError> {
//! let config = BleAdapterConfig::default();
//! let (peripheral, peripheral_events) = platform_peripheral(config.clone()).await?;
//! let (central, central_events) = platform_central(config).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use blelink_core::{CentralEvent, CentralTransport};
use tokio::sync::mpsc;

#[cfg(feature = "central")]
pub mod central;
pub mod config;
pub mod error;
pub mod peripheral;

// Public API exports
#[cfg(feature = "central")]
pub use central::BtleplugCentral;
pub use config::BleAdapterConfig;
pub use error::BleAdapterError;
pub use peripheral::{platform_peripheral, FallbackPeripheral, PeripheralHandle};

/// Central transport plus the channel its events arrive on
pub type CentralHandle = (
    Arc<dyn CentralTransport>,
    mpsc::UnboundedReceiver<CentralEvent>,
);

/// Create the central transport, if this build has one
pub async fn platform_central(config: BleAdapterConfig) -> Result<CentralHandle, BleAdapterError> {
    #[cfg(feature = "central")]
    {
        let (central, events) = BtleplugCentral::new(config).await?;
        Ok((central as Arc<dyn CentralTransport>, events))
    }
    #[cfg(not(feature = "central"))]
    {
        let _ = config;
        Err(BleAdapterError::Unsupported("central"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelink_core::PeripheralTransport;

    #[cfg(not(feature = "central"))]
    #[tokio::test]
    async fn test_central_unavailable_without_feature() {
        let result = platform_central(BleAdapterConfig::default()).await;
        assert!(matches!(result, Err(BleAdapterError::Unsupported("central"))));
    }

    #[cfg(not(all(target_os = "linux", feature = "peripheral")))]
    #[tokio::test]
    async fn test_peripheral_falls_back_without_feature() {
        let (peripheral, _events) = platform_peripheral(BleAdapterConfig::default())
            .await
            .unwrap();
        assert!(!peripheral.supports_advertising());
    }
}
