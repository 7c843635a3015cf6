//! Platform peripheral transports
//!
//! btleplug has no peripheral mode, so advertising and the GATT server go
//! through BlueZ directly on Linux. Every other build gets a transport that
//! reports advertising as unsupported.

use std::sync::Arc;

use blelink_core::{PeripheralEvent, PeripheralTransport};
use tokio::sync::mpsc;

use crate::config::BleAdapterConfig;
use crate::error::BleAdapterError;

mod fallback;
#[cfg(all(target_os = "linux", feature = "peripheral"))]
mod linux;

pub use fallback::FallbackPeripheral;
#[cfg(all(target_os = "linux", feature = "peripheral"))]
pub use linux::BluezPeripheral;

/// Peripheral transport plus the channel its events arrive on
pub type PeripheralHandle = (
    Arc<dyn PeripheralTransport>,
    mpsc::UnboundedReceiver<PeripheralEvent>,
);

/// Create the best peripheral transport this build supports
pub async fn platform_peripheral(
    config: BleAdapterConfig,
) -> Result<PeripheralHandle, BleAdapterError> {
    #[cfg(all(target_os = "linux", feature = "peripheral"))]
    {
        let (peripheral, events) = BluezPeripheral::new(config).await?;
        Ok((peripheral as Arc<dyn PeripheralTransport>, events))
    }
    #[cfg(not(all(target_os = "linux", feature = "peripheral")))]
    {
        let _ = config;
        let (_tx, events) = mpsc::unbounded_channel();
        Ok((Arc::new(FallbackPeripheral::new()) as Arc<dyn PeripheralTransport>, events))
    }
}
