//! Peripheral transport for platforms that cannot advertise

use blelink_core::{
    AdvertisementData, AdvertisementHandle, GattServer, LinkError, PeripheralTransport, Result,
    ServiceLayout,
};
use tracing::warn;

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Reports advertising as unsupported so the link can tell the host
#[derive(Debug, Default)]
pub struct FallbackPeripheral;

impl FallbackPeripheral {
    pub fn new() -> Self {
        Self
    }
}

impl PeripheralTransport for FallbackPeripheral {
    fn supports_advertising(&self) -> bool {
        false
    }

    fn start_advertising(&self, _data: &AdvertisementData) -> Result<Box<dyn AdvertisementHandle>> {
        warn!("BLE advertising not supported on this platform");
        Err(LinkError::AdvertisingUnsupported)
    }

    fn open_gatt_server(&self, _service: &ServiceLayout) -> Result<Box<dyn GattServer>> {
        Err(LinkError::GattServer(
            "GATT server not available on this platform".to_string(),
        ))
    }
}
