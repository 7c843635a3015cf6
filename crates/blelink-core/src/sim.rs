//! In-memory radio
//!
//! `SimRadio` connects one simulated central to any number of simulated
//! peripherals through tokio channels, so both links can run end to end
//! without hardware. Requests complete immediately and their outcomes are
//! queued as events on the channels returned by [`SimRadio::central`] and
//! [`SimRadio::peripheral`]. Faults are injected by dropping connections,
//! rotating a peripheral's address, or cutting power.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{LinkError, Result};
use crate::lock;
use crate::protocol::{
    Advertisement, AdvertisementData, GattStatus, ServiceLayout, WriteType,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::transport::{
    AdvertisementHandle, CentralEvent, CentralTransport, ConnectionId, ConnectionOutcome,
    GattConnection, GattServer, PeripheralEvent, PeripheralTransport, ScanId,
};

// ----------------------------------------------------------------------------
// Shared Air
// ----------------------------------------------------------------------------

struct CentralNode {
    address: String,
    events: mpsc::UnboundedSender<CentralEvent>,
    scanning: bool,
}

struct PeripheralNode {
    id: u64,
    address: String,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    advertisement: Option<AdvertisementData>,
    service: Option<ServiceLayout>,
    notify_value: Vec<u8>,
}

struct SimLink {
    connection: ConnectionId,
    peripheral: u64,
    notifications: bool,
    subscribed: bool,
}

struct Air {
    powered: bool,
    central: Option<CentralNode>,
    peripherals: Vec<PeripheralNode>,
    links: Vec<SimLink>,
    next_request: u32,
}

impl Air {
    fn peripheral(&self, id: u64) -> Option<&PeripheralNode> {
        self.peripherals.iter().find(|p| p.id == id)
    }

    fn peripheral_mut(&mut self, id: u64) -> Option<&mut PeripheralNode> {
        self.peripherals.iter_mut().find(|p| p.id == id)
    }

    fn link(&self, connection: ConnectionId) -> Option<&SimLink> {
        self.links.iter().find(|l| l.connection == connection)
    }

    fn link_mut(&mut self, connection: ConnectionId) -> Option<&mut SimLink> {
        self.links.iter_mut().find(|l| l.connection == connection)
    }

    fn central_address(&self) -> String {
        self.central
            .as_ref()
            .map(|c| c.address.clone())
            .unwrap_or_default()
    }

    fn request_id(&mut self) -> u32 {
        self.next_request = self.next_request.wrapping_add(1);
        self.next_request
    }

    fn to_central(&self, event: CentralEvent) {
        if let Some(central) = &self.central {
            let _ = central.events.send(event);
        }
    }

    fn to_peripheral(&self, id: u64, event: PeripheralEvent) {
        if let Some(node) = self.peripheral(id) {
            let _ = node.events.send(event);
        }
    }

    fn advertise(&self, node: &PeripheralNode) {
        let Some(data) = &node.advertisement else {
            return;
        };
        if !self.central.as_ref().is_some_and(|c| c.scanning) {
            return;
        }
        self.to_central(CentralEvent::Advertisement(Advertisement {
            address: node.address.clone(),
            local_name: None,
            services: vec![data.service_uuid],
            service_data: data.service_data.clone(),
        }));
    }

    /// Remove every link matching `predicate`, telling both ends
    fn sever(&mut self, predicate: impl Fn(&SimLink) -> bool) -> usize {
        let (severed, kept): (Vec<SimLink>, Vec<SimLink>) =
            self.links.drain(..).partition(|l| predicate(l));
        self.links = kept;

        let central = self.central_address();
        for link in &severed {
            let address = self
                .peripheral(link.peripheral)
                .map(|p| p.address.clone())
                .unwrap_or_default();
            self.to_central(CentralEvent::ConnectionStateChanged {
                connection: link.connection,
                address,
                outcome: ConnectionOutcome::Disconnected,
            });
            self.to_peripheral(
                link.peripheral,
                PeripheralEvent::ConnectionStateChanged {
                    address: central.clone(),
                    connected: false,
                },
            );
        }
        severed.len()
    }
}

struct SimShared {
    air: Mutex<Air>,
    next_connection: AtomicU64,
    next_peripheral: AtomicU64,
    scans: AtomicUsize,
    connects: AtomicUsize,
    writes: AtomicUsize,
    notifications: AtomicUsize,
}

// ----------------------------------------------------------------------------
// Radio
// ----------------------------------------------------------------------------

/// Loopback radio shared by the simulated transports
#[derive(Clone)]
pub struct SimRadio {
    shared: Arc<SimShared>,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                air: Mutex::new(Air {
                    powered: true,
                    central: None,
                    peripherals: Vec::new(),
                    links: Vec::new(),
                    next_request: 0,
                }),
                next_connection: AtomicU64::new(1),
                next_peripheral: AtomicU64::new(1),
                scans: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                notifications: AtomicUsize::new(0),
            }),
        }
    }

    /// The central side, seen by peripherals as `address`; replaces any
    /// previous central
    pub fn central(&self, address: &str) -> (Arc<SimCentral>, mpsc::UnboundedReceiver<CentralEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.air).central = Some(CentralNode {
            address: address.to_string(),
            events: tx,
            scanning: false,
        });
        let central = Arc::new(SimCentral {
            shared: self.shared.clone(),
        });
        (central, rx)
    }

    /// A peripheral reachable at `address`
    pub fn peripheral(
        &self,
        address: &str,
    ) -> (Arc<SimPeripheral>, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_peripheral.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.air).peripherals.push(PeripheralNode {
            id,
            address: address.to_string(),
            events: tx,
            advertisement: None,
            service: None,
            notify_value: Vec::new(),
        });
        let peripheral = Arc::new(SimPeripheral {
            id,
            shared: self.shared.clone(),
            supported: AtomicBool::new(true),
        });
        (peripheral, rx)
    }

    /// Drop the link to the peripheral at `address` as if it went out of
    /// range; returns whether a link existed
    pub fn drop_connection(&self, address: &str) -> bool {
        let mut air = lock(&self.shared.air);
        let Some(id) = air
            .peripherals
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.id)
        else {
            return false;
        };
        debug!("Sim dropping link to {}", address);
        air.sever(|l| l.peripheral == id) > 0
    }

    /// Change the address the peripheral at `old` is reachable under
    pub fn rotate_address(&self, old: &str, new: &str) {
        let mut air = lock(&self.shared.air);
        if let Some(node) = air.peripherals.iter_mut().find(|p| p.address == old) {
            node.address = new.to_string();
            debug!("Sim rotated {} to {}", old, new);
        }
    }

    /// Switch the shared radio on or off
    pub fn set_powered(&self, powered: bool) {
        let mut air = lock(&self.shared.air);
        air.powered = powered;
        if !powered {
            air.sever(|_| true);
            if let Some(central) = air.central.as_mut() {
                central.scanning = false;
            }
            for node in air.peripherals.iter_mut() {
                node.advertisement = None;
                node.service = None;
            }
        }
        air.to_central(CentralEvent::AdapterStateChanged { powered });
        for node in &air.peripherals {
            let _ = node
                .events
                .send(PeripheralEvent::AdapterStateChanged { powered });
        }
    }

    pub fn scans_started(&self) -> usize {
        self.shared.scans.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn characteristic_writes(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    pub fn notifications_sent(&self) -> usize {
        self.shared.notifications.load(Ordering::SeqCst)
    }

    pub fn active_links(&self) -> usize {
        lock(&self.shared.air).links.len()
    }
}

// ----------------------------------------------------------------------------
// Central Side
// ----------------------------------------------------------------------------

/// Simulated central transport
pub struct SimCentral {
    shared: Arc<SimShared>,
}

impl CentralTransport for SimCentral {
    fn is_enabled(&self) -> bool {
        lock(&self.shared.air).powered
    }

    fn start_scan(&self, _service: Uuid, _scan: ScanId) -> Result<()> {
        let mut air = lock(&self.shared.air);
        if !air.powered {
            return Err(LinkError::AdapterPoweredOff);
        }
        let Some(central) = air.central.as_mut() else {
            return Err(LinkError::ScanFailed("no central registered".to_string()));
        };
        central.scanning = true;
        self.shared.scans.fetch_add(1, Ordering::SeqCst);

        for node in &air.peripherals {
            air.advertise(node);
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        if let Some(central) = lock(&self.shared.air).central.as_mut() {
            central.scanning = false;
        }
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>> {
        let mut air = lock(&self.shared.air);
        if !air.powered {
            return Err(LinkError::AdapterPoweredOff);
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let connection = ConnectionId(self.shared.next_connection.fetch_add(1, Ordering::SeqCst));

        let target = air
            .peripherals
            .iter()
            .find(|p| p.address == address && p.service.is_some())
            .map(|p| p.id);

        match target {
            Some(peripheral) => {
                air.links.push(SimLink {
                    connection,
                    peripheral,
                    notifications: false,
                    subscribed: false,
                });
                air.to_central(CentralEvent::ConnectionStateChanged {
                    connection,
                    address: address.to_string(),
                    outcome: ConnectionOutcome::Connected,
                });
                let central = air.central_address();
                air.to_peripheral(
                    peripheral,
                    PeripheralEvent::ConnectionStateChanged {
                        address: central,
                        connected: true,
                    },
                );
            }
            None => air.to_central(CentralEvent::ConnectionStateChanged {
                connection,
                address: address.to_string(),
                outcome: ConnectionOutcome::Failed(format!("no device at {}", address)),
            }),
        }

        Ok(Box::new(SimConnection {
            id: connection,
            address: address.to_string(),
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimConnection {
    id: ConnectionId,
    address: String,
    shared: Arc<SimShared>,
    closed: AtomicBool,
}

impl GattConnection for SimConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn discover_services(&self) -> Result<()> {
        let air = lock(&self.shared.air);
        let result = air
            .link(self.id)
            .and_then(|link| air.peripheral(link.peripheral))
            .and_then(|node| node.service.clone())
            .map(|service| vec![service])
            .ok_or_else(|| "not connected".to_string());
        air.to_central(CentralEvent::ServicesDiscovered {
            connection: self.id,
            result,
        });
        Ok(())
    }

    fn set_notifications(&self, _characteristic: Uuid, enabled: bool) -> Result<()> {
        let mut air = lock(&self.shared.air);
        let link = air.link_mut(self.id).ok_or(LinkError::NotConnected)?;
        link.notifications = enabled;
        Ok(())
    }

    fn write_descriptor(&self, _characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<()> {
        let mut air = lock(&self.shared.air);
        let request_id = air.request_id();
        let central = air.central_address();
        let link = air.link_mut(self.id).ok_or(LinkError::NotConnected)?;
        link.subscribed = value == ENABLE_NOTIFICATION_VALUE;
        let peripheral = link.peripheral;

        air.to_peripheral(
            peripheral,
            PeripheralEvent::DescriptorWriteRequest {
                address: central,
                request_id,
                descriptor,
                value: value.to_vec(),
                response_needed: true,
            },
        );
        air.to_central(CentralEvent::DescriptorWritten {
            connection: self.id,
            descriptor,
            result: Ok(()),
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let mut air = lock(&self.shared.air);
        let request_id = air.request_id();
        let central = air.central_address();
        let peripheral = air.link(self.id).ok_or(LinkError::NotConnected)?.peripheral;
        self.shared.writes.fetch_add(1, Ordering::SeqCst);

        air.to_peripheral(
            peripheral,
            PeripheralEvent::WriteRequest {
                address: central,
                request_id,
                characteristic,
                value: value.to_vec(),
                response_needed: write_type == WriteType::WithResponse,
            },
        );
        air.to_central(CentralEvent::CharacteristicWritten {
            connection: self.id,
            characteristic,
            result: Ok(()),
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let id = self.id;
        lock(&self.shared.air).sever(|l| l.connection == id);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(LinkError::transport("connection already closed"));
        }
        let id = self.id;
        lock(&self.shared.air).links.retain(|l| l.connection != id);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peripheral Side
// ----------------------------------------------------------------------------

/// Simulated peripheral transport
pub struct SimPeripheral {
    id: u64,
    shared: Arc<SimShared>,
    supported: AtomicBool,
}

impl SimPeripheral {
    /// Pretend the platform cannot advertise
    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }
}

impl PeripheralTransport for SimPeripheral {
    fn supports_advertising(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn start_advertising(&self, data: &AdvertisementData) -> Result<Box<dyn AdvertisementHandle>> {
        let mut air = lock(&self.shared.air);
        if !air.powered {
            return Err(LinkError::AdapterPoweredOff);
        }
        let node = air
            .peripheral_mut(self.id)
            .ok_or_else(|| LinkError::transport("peripheral not registered"))?;
        node.advertisement = Some(data.clone());
        let _ = node.events.send(PeripheralEvent::AdvertisingStarted);

        if let Some(node) = air.peripheral(self.id) {
            air.advertise(node);
        }
        Ok(Box::new(SimAdvertisement {
            id: self.id,
            shared: self.shared.clone(),
        }))
    }

    fn open_gatt_server(&self, service: &ServiceLayout) -> Result<Box<dyn GattServer>> {
        let mut air = lock(&self.shared.air);
        let node = air
            .peripheral_mut(self.id)
            .ok_or_else(|| LinkError::transport("peripheral not registered"))?;
        node.service = Some(service.clone());
        Ok(Box::new(SimServer {
            id: self.id,
            shared: self.shared.clone(),
        }))
    }
}

struct SimAdvertisement {
    id: u64,
    shared: Arc<SimShared>,
}

impl AdvertisementHandle for SimAdvertisement {
    fn stop(&self) -> Result<()> {
        if let Some(node) = lock(&self.shared.air).peripheral_mut(self.id) {
            node.advertisement = None;
        }
        Ok(())
    }
}

struct SimServer {
    id: u64,
    shared: Arc<SimShared>,
}

impl GattServer for SimServer {
    fn send_response(
        &self,
        address: &str,
        request_id: u32,
        status: GattStatus,
        _value: Option<&[u8]>,
    ) -> Result<()> {
        debug!("Sim response {:?} to {} for request {}", status, address, request_id);
        Ok(())
    }

    fn set_characteristic_value(&self, _characteristic: Uuid, value: &[u8]) -> Result<()> {
        let mut air = lock(&self.shared.air);
        let node = air.peripheral_mut(self.id).ok_or(LinkError::NotConnected)?;
        node.notify_value = value.to_vec();
        Ok(())
    }

    fn notify_characteristic_changed(
        &self,
        address: &str,
        characteristic: Uuid,
        _confirm: bool,
    ) -> Result<()> {
        let air = lock(&self.shared.air);
        if air.central_address() != address {
            return Err(LinkError::NotConnected);
        }
        let link = air
            .links
            .iter()
            .find(|l| l.peripheral == self.id)
            .ok_or(LinkError::NotConnected)?;
        let value = air
            .peripheral(self.id)
            .map(|node| node.notify_value.clone())
            .unwrap_or_default();

        if link.notifications && link.subscribed {
            self.shared.notifications.fetch_add(1, Ordering::SeqCst);
            air.to_central(CentralEvent::Notification {
                connection: link.connection,
                characteristic,
                value,
            });
        }
        air.to_peripheral(
            self.id,
            PeripheralEvent::NotificationSent {
                address: address.to_string(),
                result: Ok(()),
            },
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut air = lock(&self.shared.air);
        let id = self.id;
        air.sever(|l| l.peripheral == id);
        if let Some(node) = air.peripheral_mut(id) {
            node.service = None;
        }
        Ok(())
    }
}
