//! Call-recording transports and host for unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::errors::{LinkError, Result};
use crate::host::{LinkCallback, LogLevel};
use crate::lock;
use crate::protocol::{AdvertisementData, GattStatus, ServiceLayout, WriteType};
use crate::scanner::DiscoveredPeer;
use crate::transport::{
    AdvertisementHandle, CentralTransport, ConnectionId, GattConnection, GattServer,
    PeripheralTransport, ScanId,
};

type Hook = Arc<dyn Fn() + Send + Sync>;

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan,
    StopScan,
    Connect {
        address: String,
    },
    DiscoverServices {
        connection: ConnectionId,
    },
    SetNotifications {
        characteristic: Uuid,
        enabled: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    WriteCharacteristic {
        connection: ConnectionId,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Close {
        connection: ConnectionId,
    },
}

#[derive(Default)]
struct CentralShared {
    calls: Mutex<Vec<CentralCall>>,
    next_id: AtomicU64,
    disabled: AtomicBool,
    fail_scan: AtomicBool,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    last_scan: Mutex<Option<ScanId>>,
    on_enabled_check: Mutex<Option<Hook>>,
    on_scan_start: Mutex<Option<Hook>>,
}

impl CentralShared {
    fn record(&self, call: CentralCall) {
        lock(&self.calls).push(call);
    }
}

fn run_hook(slot: &Mutex<Option<Hook>>) {
    let hook = lock(slot).clone();
    if let Some(hook) = hook {
        hook();
    }
}

#[derive(Default)]
pub struct MockCentral {
    shared: Arc<CentralShared>,
}

impl MockCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        lock(&self.shared.calls).clone()
    }

    pub fn scan_count(&self) -> usize {
        self.count(|c| matches!(c, CentralCall::StartScan))
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, CentralCall::Connect { .. }))
    }

    pub fn last_connection(&self) -> Option<ConnectionId> {
        let next = self.shared.next_id.load(Ordering::SeqCst);
        (next > 0).then(|| ConnectionId(next - 1))
    }

    /// Payloads of every characteristic write, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.calls)
            .iter()
            .filter_map(|c| match c {
                CentralCall::WriteCharacteristic { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.disabled.store(!enabled, Ordering::SeqCst);
    }

    pub fn fail_scan(&self, fail: bool) {
        self.shared.fail_scan.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.shared.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Session id passed to the most recent `start_scan`
    pub fn last_scan(&self) -> Option<ScanId> {
        *lock(&self.shared.last_scan)
    }

    /// Run `hook` inside every `is_enabled` call
    pub fn on_enabled_check(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.on_enabled_check) = Some(Arc::new(hook));
    }

    /// Run `hook` inside every `start_scan` call, before it returns
    pub fn on_scan_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.on_scan_start) = Some(Arc::new(hook));
    }

    pub fn clear_hooks(&self) {
        lock(&self.shared.on_enabled_check).take();
        lock(&self.shared.on_scan_start).take();
    }

    fn count(&self, predicate: impl Fn(&CentralCall) -> bool) -> usize {
        lock(&self.shared.calls).iter().filter(|c| predicate(c)).count()
    }
}

impl CentralTransport for MockCentral {
    fn is_enabled(&self) -> bool {
        run_hook(&self.shared.on_enabled_check);
        !self.shared.disabled.load(Ordering::SeqCst)
    }

    fn start_scan(&self, _service: Uuid, scan: ScanId) -> Result<()> {
        if self.shared.fail_scan.load(Ordering::SeqCst) {
            return Err(LinkError::ScanFailed("scanner unavailable".to_string()));
        }
        self.shared.record(CentralCall::StartScan);
        *lock(&self.shared.last_scan) = Some(scan);
        run_hook(&self.shared.on_scan_start);
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.shared.record(CentralCall::StopScan);
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>> {
        self.shared.record(CentralCall::Connect {
            address: address.to_string(),
        });
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionFailed {
                address: address.to_string(),
                reason: "device unreachable".to_string(),
            });
        }
        let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(Box::new(MockConnection {
            id,
            address: address.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct MockConnection {
    id: ConnectionId,
    address: String,
    shared: Arc<CentralShared>,
}

impl GattConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn discover_services(&self) -> Result<()> {
        self.shared
            .record(CentralCall::DiscoverServices { connection: self.id });
        Ok(())
    }

    fn set_notifications(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        self.shared.record(CentralCall::SetNotifications {
            characteristic,
            enabled,
        });
        Ok(())
    }

    fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<()> {
        self.shared.record(CentralCall::WriteDescriptor {
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.shared.record(CentralCall::WriteCharacteristic {
            connection: self.id,
            characteristic,
            value: value.to_vec(),
            write_type,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.shared
            .record(CentralCall::Disconnect { connection: self.id });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.record(CentralCall::Close { connection: self.id });
        if self.shared.fail_close.load(Ordering::SeqCst) {
            return Err(LinkError::transport("handle already released"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    StartAdvertising { data: AdvertisementData },
    StopAdvertising,
    OpenServer,
    SendResponse {
        address: String,
        request_id: u32,
        status: GattStatus,
        value: Option<Vec<u8>>,
    },
    SetValue {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Notify {
        address: String,
        characteristic: Uuid,
    },
    CloseServer,
}

#[derive(Default)]
struct PeripheralShared {
    calls: Mutex<Vec<PeripheralCall>>,
    unsupported: AtomicBool,
    fail_advertising: AtomicBool,
    fail_server: AtomicBool,
    fail_stop: AtomicBool,
    unreachable: Mutex<HashSet<String>>,
}

impl PeripheralShared {
    fn record(&self, call: PeripheralCall) {
        lock(&self.calls).push(call);
    }
}

#[derive(Default)]
pub struct MockPeripheral {
    shared: Arc<PeripheralShared>,
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PeripheralCall> {
        lock(&self.shared.calls).clone()
    }

    pub fn notified(&self) -> Vec<String> {
        lock(&self.shared.calls)
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Notify { address, .. } => Some(address.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<(u32, GattStatus, Option<Vec<u8>>)> {
        lock(&self.shared.calls)
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::SendResponse {
                    request_id,
                    status,
                    value,
                    ..
                } => Some((*request_id, *status, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn advertising_starts(&self) -> usize {
        lock(&self.shared.calls)
            .iter()
            .filter(|c| matches!(c, PeripheralCall::StartAdvertising { .. }))
            .count()
    }

    pub fn set_supported(&self, supported: bool) {
        self.shared.unsupported.store(!supported, Ordering::SeqCst);
    }

    pub fn fail_advertising(&self, fail: bool) {
        self.shared.fail_advertising.store(fail, Ordering::SeqCst);
    }

    pub fn fail_server(&self, fail: bool) {
        self.shared.fail_server.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.shared.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Make notifications to `address` fail
    pub fn make_unreachable(&self, address: &str) {
        lock(&self.shared.unreachable).insert(address.to_string());
    }
}

impl PeripheralTransport for MockPeripheral {
    fn supports_advertising(&self) -> bool {
        !self.shared.unsupported.load(Ordering::SeqCst)
    }

    fn start_advertising(&self, data: &AdvertisementData) -> Result<Box<dyn AdvertisementHandle>> {
        self.shared
            .record(PeripheralCall::StartAdvertising { data: data.clone() });
        if self.shared.fail_advertising.load(Ordering::SeqCst) {
            return Err(LinkError::AdvertisingFailed("too many advertisers".to_string()));
        }
        Ok(Box::new(MockAdvertisement {
            shared: self.shared.clone(),
        }))
    }

    fn open_gatt_server(&self, _service: &ServiceLayout) -> Result<Box<dyn GattServer>> {
        self.shared.record(PeripheralCall::OpenServer);
        if self.shared.fail_server.load(Ordering::SeqCst) {
            return Err(LinkError::GattServer("server unavailable".to_string()));
        }
        Ok(Box::new(MockServer {
            shared: self.shared.clone(),
        }))
    }
}

struct MockAdvertisement {
    shared: Arc<PeripheralShared>,
}

impl AdvertisementHandle for MockAdvertisement {
    fn stop(&self) -> Result<()> {
        self.shared.record(PeripheralCall::StopAdvertising);
        if self.shared.fail_stop.load(Ordering::SeqCst) {
            return Err(LinkError::transport("advertiser already gone"));
        }
        Ok(())
    }
}

struct MockServer {
    shared: Arc<PeripheralShared>,
}

impl GattServer for MockServer {
    fn send_response(
        &self,
        address: &str,
        request_id: u32,
        status: GattStatus,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.shared.record(PeripheralCall::SendResponse {
            address: address.to_string(),
            request_id,
            status,
            value: value.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    fn set_characteristic_value(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.shared.record(PeripheralCall::SetValue {
            characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn notify_characteristic_changed(
        &self,
        address: &str,
        characteristic: Uuid,
        _confirm: bool,
    ) -> Result<()> {
        if lock(&self.shared.unreachable).contains(address) {
            return Err(LinkError::NotConnected);
        }
        self.shared.record(PeripheralCall::Notify {
            address: address.to_string(),
            characteristic,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.record(PeripheralCall::CloseServer);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Host
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHost {
    connected: AtomicUsize,
    messages: Mutex<Vec<String>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
    discovered: Mutex<Vec<DiscoveredPeer>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        lock(&self.discovered).clone()
    }

    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        lock(&self.logs).clone()
    }

    /// Whether a line at `level` containing `fragment` was logged
    pub fn has_log(&self, level: LogLevel, fragment: &str) -> bool {
        lock(&self.logs)
            .iter()
            .any(|(l, text)| *l == level && text.contains(fragment))
    }
}

impl LinkCallback for RecordingHost {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message_received(&self, text: &str) {
        lock(&self.messages).push(text.to_string());
    }

    fn on_log(&self, level: LogLevel, text: &str) {
        lock(&self.logs).push((level, text.to_string()));
    }

    fn on_peer_discovered(&self, peer: &DiscoveredPeer) {
        lock(&self.discovered).push(peer.clone());
    }
}
