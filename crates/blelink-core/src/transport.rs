//! Radio primitives the links drive
//!
//! Platform adapters (btleplug, BlueZ, the simulator, test mocks) implement
//! these traits. Every method only initiates work and returns immediately;
//! an `Err` means the request could not even be issued. Outcomes come back
//! later as [`CentralEvent`]s or [`PeripheralEvent`]s on an unbounded channel
//! that the matching event pump feeds into the link.

use std::fmt;

use uuid::Uuid;

use crate::errors::Result;
use crate::protocol::{Advertisement, AdvertisementData, GattStatus, ServiceLayout, WriteType};

// ----------------------------------------------------------------------------
// Central Side
// ----------------------------------------------------------------------------

/// Identifies one outbound connection attempt for the lifetime of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identifies one discovery session; failures reported for an older session
/// leave the current one running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Scanning and connecting
pub trait CentralTransport: Send + Sync {
    /// Whether the radio is currently powered on
    fn is_enabled(&self) -> bool;

    /// Begin a discovery session filtered to `service`; a later failure is
    /// reported as [`CentralEvent::ScanFailed`] carrying `scan`
    fn start_scan(&self, service: Uuid, scan: ScanId) -> Result<()>;

    /// End the current discovery session
    fn stop_scan(&self) -> Result<()>;

    /// Begin connecting to `address`
    fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>>;
}

/// One outbound GATT connection
pub trait GattConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn address(&self) -> &str;

    /// Begin service and characteristic discovery
    fn discover_services(&self) -> Result<()>;

    /// Enable or disable local delivery of notifications from `characteristic`
    fn set_notifications(&self, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Begin writing a descriptor value
    fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8])
        -> Result<()>;

    /// Begin writing a characteristic value
    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Begin tearing down the link
    fn disconnect(&self) -> Result<()>;

    /// Release the handle; fails if it was already released
    fn close(&self) -> Result<()>;
}

/// Outcome of a connection attempt or a later state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected,
    Disconnected,
    Failed(String),
}

/// Asynchronous reports from a central transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    Advertisement(Advertisement),
    ScanFailed {
        scan: ScanId,
        reason: String,
    },
    ConnectionStateChanged {
        connection: ConnectionId,
        address: String,
        outcome: ConnectionOutcome,
    },
    ServicesDiscovered {
        connection: ConnectionId,
        result: std::result::Result<Vec<ServiceLayout>, String>,
    },
    DescriptorWritten {
        connection: ConnectionId,
        descriptor: Uuid,
        result: std::result::Result<(), String>,
    },
    CharacteristicWritten {
        connection: ConnectionId,
        characteristic: Uuid,
        result: std::result::Result<(), String>,
    },
    Notification {
        connection: ConnectionId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    AdapterStateChanged {
        powered: bool,
    },
}

// ----------------------------------------------------------------------------
// Peripheral Side
// ----------------------------------------------------------------------------

/// Advertising and hosting the GATT server
pub trait PeripheralTransport: Send + Sync {
    /// Whether this radio can advertise at all
    fn supports_advertising(&self) -> bool;

    /// Begin advertising `data`
    fn start_advertising(&self, data: &AdvertisementData) -> Result<Box<dyn AdvertisementHandle>>;

    /// Open a GATT server publishing `service`
    fn open_gatt_server(&self, service: &ServiceLayout) -> Result<Box<dyn GattServer>>;
}

/// A running advertisement
pub trait AdvertisementHandle: Send + Sync {
    fn stop(&self) -> Result<()>;
}

/// A running GATT server
pub trait GattServer: Send + Sync {
    /// Answer a read or write request
    fn send_response(
        &self,
        address: &str,
        request_id: u32,
        status: GattStatus,
        value: Option<&[u8]>,
    ) -> Result<()>;

    /// Replace the local value of `characteristic`
    fn set_characteristic_value(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Push the current value of `characteristic` to `address`
    fn notify_characteristic_changed(
        &self,
        address: &str,
        characteristic: Uuid,
        confirm: bool,
    ) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Asynchronous reports from a peripheral transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    AdvertisingStarted,
    AdvertisingFailed {
        reason: String,
    },
    ConnectionStateChanged {
        address: String,
        connected: bool,
    },
    ReadRequest {
        address: String,
        request_id: u32,
        characteristic: Uuid,
        offset: usize,
    },
    WriteRequest {
        address: String,
        request_id: u32,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    DescriptorWriteRequest {
        address: String,
        request_id: u32,
        descriptor: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    NotificationSent {
        address: String,
        result: std::result::Result<(), String>,
    },
    AdapterStateChanged {
        powered: bool,
    },
}
