//! Peripheral role: advertise, host the GATT server, broadcast
//!
//! The advertisement carries this installation's device identifier as service
//! data, which is how a scanning central recognises it across address
//! rotations. Connected centrals are tracked in a [`PeerSet`] that is written
//! from the transport's event context and read by broadcasts from the host's.

use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::host::{HostLog, LinkCallback, LogLevel, Outbox};
use crate::identity::IdentityStore;
use crate::lock;
use crate::protocol::{
    decode_message, encode_message, AdvertisementData, GattStatus, ServiceLayout,
    ENABLE_NOTIFICATION_VALUE, NOTIFY_CHARACTERISTIC_UUID, NOTIFY_DESCRIPTOR_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
use crate::transport::{AdvertisementHandle, GattServer, PeripheralEvent, PeripheralTransport};

// ----------------------------------------------------------------------------
// Peer Set
// ----------------------------------------------------------------------------

/// Concurrent set of connected central addresses
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: DashSet<String>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the address was already present
    pub fn insert(&self, address: &str) -> bool {
        self.peers.insert(address.to_string())
    }

    pub fn remove(&self, address: &str) -> bool {
        self.peers.remove(address).is_some()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Point-in-time copy, sorted for stable output
    pub fn snapshot(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        peers.sort();
        peers
    }
}

// ----------------------------------------------------------------------------
// Peripheral Link
// ----------------------------------------------------------------------------

struct PeripheralInner {
    advertiser: Option<Box<dyn AdvertisementHandle>>,
    server: Option<Box<dyn GattServer>>,
    active: bool,
    radio_enabled: bool,
}

/// Owns the peripheral side of the link
pub struct PeripheralLink {
    config: LinkConfig,
    transport: Arc<dyn PeripheralTransport>,
    identity: IdentityStore,
    log: HostLog,
    peers: PeerSet,
    subscribed: PeerSet,
    inner: Mutex<PeripheralInner>,
}

impl PeripheralLink {
    pub fn new(
        config: LinkConfig,
        transport: Arc<dyn PeripheralTransport>,
        identity: IdentityStore,
        callback: Arc<dyn LinkCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            identity,
            log: HostLog::new(callback, "peripheral"),
            peers: PeerSet::new(),
            subscribed: PeerSet::new(),
            inner: Mutex::new(PeripheralInner {
                advertiser: None,
                server: None,
                active: false,
                radio_enabled: true,
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Advertise the message service and open the GATT server
    pub fn start_advertising(&self) {
        if !self.transport.supports_advertising() {
            self.log.error("BLE Advertising not supported on this device");
            return;
        }

        let device_id = self.identity.get_or_create_id();
        let mut out = Outbox::default();
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            inner.active = true;

            if !inner.radio_enabled {
                out.log(LogLevel::Warn, "Bluetooth is off, advertising deferred");
            } else if inner.advertiser.is_some() {
                out.log(LogLevel::Debug, "Already advertising");
            } else {
                out.log(LogLevel::Info, format!("Device UniqueID = {}", device_id));
                match self
                    .transport
                    .start_advertising(&AdvertisementData::for_device(&device_id))
                {
                    Ok(handle) => {
                        inner.advertiser = Some(handle);
                        if inner.server.is_none() {
                            out.log(LogLevel::Info, "Start Gatt Server");
                            match self.transport.open_gatt_server(&ServiceLayout::message_service()) {
                                Ok(server) => inner.server = Some(server),
                                Err(e) => out.log(
                                    LogLevel::Error,
                                    format!("Failed to start GATT server: {}", e),
                                ),
                            }
                        }
                    }
                    Err(e) => out.log(LogLevel::Error, format!("Advertising failed: {}", e)),
                }
            }
        }
        out.deliver(&self.log);
    }

    /// Stop advertising and close the server; each step runs even if the
    /// other fails
    pub fn stop_advertising(&self) {
        let (advertiser, server) = {
            let mut inner = lock(&self.inner);
            inner.active = false;
            (inner.advertiser.take(), inner.server.take())
        };
        self.release(advertiser, server);
        self.log.info("Advertising stopped");
    }

    /// Push `text` to every connected central
    pub fn send_message_to_all(&self, text: &str) {
        let payload = encode_message(text);
        let mut out = Outbox::default();
        {
            let inner = lock(&self.inner);
            match inner.server.as_ref() {
                None => out.log(LogLevel::Warn, "GATT server not running, message not sent"),
                Some(server) => {
                    if let Err(e) = server.set_characteristic_value(NOTIFY_CHARACTERISTIC_UUID, &payload) {
                        out.log(LogLevel::Error, format!("Failed to set notify value: {}", e));
                    } else {
                        let peers = self.peers.snapshot();
                        out.log(
                            LogLevel::Info,
                            format!("Sending message to {} client(s): {}", peers.len(), text),
                        );
                        for address in peers {
                            if let Err(e) = server.notify_characteristic_changed(
                                &address,
                                NOTIFY_CHARACTERISTIC_UUID,
                                false,
                            ) {
                                out.log(
                                    LogLevel::Warn,
                                    format!("Failed to notify {}: {}", address, e),
                                );
                            }
                        }
                    }
                }
            }
        }
        out.deliver(&self.log);
    }

    /// Feed one transport event into the link
    pub fn handle_event(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::AdvertisingStarted => {
                self.log.info("Advertising started successfully")
            }
            PeripheralEvent::AdvertisingFailed { reason } => {
                let advertiser = lock(&self.inner).advertiser.take();
                self.release(advertiser, None);
                self.log.error(format!("Advertising failed: {}", reason));
            }
            PeripheralEvent::ConnectionStateChanged { address, connected } => {
                self.on_connection_state(&address, connected)
            }
            PeripheralEvent::ReadRequest {
                address,
                request_id,
                characteristic,
                offset,
            } => self.on_read_request(&address, request_id, characteristic, offset),
            PeripheralEvent::WriteRequest {
                address,
                request_id,
                characteristic,
                value,
                response_needed,
            } => self.on_write_request(&address, request_id, characteristic, value, response_needed),
            PeripheralEvent::DescriptorWriteRequest {
                address,
                request_id,
                descriptor,
                value,
                response_needed,
            } => self.on_descriptor_write(&address, request_id, descriptor, &value, response_needed),
            PeripheralEvent::NotificationSent { address, result } => match result {
                Ok(()) => self.log.debug(format!("Notification sent to {}", address)),
                Err(reason) => self
                    .log
                    .warn(format!("Notification to {} failed: {}", address, reason)),
            },
            PeripheralEvent::AdapterStateChanged { powered } => self.on_adapter_state(powered),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Addresses of the connected centrals
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.inner).advertiser.is_some()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).active
    }

    /// Whether `address` has enabled notifications
    pub fn is_subscribed(&self, address: &str) -> bool {
        self.subscribed.contains(address)
    }

    pub fn device_id(&self) -> String {
        self.identity.get_or_create_id()
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn on_connection_state(&self, address: &str, connected: bool) {
        if connected {
            self.peers.insert(address);
            self.log.info(format!("Server connected to {}", address));
        } else {
            self.peers.remove(address);
            self.subscribed.remove(address);
            self.log.info(format!("Server disconnected from {}", address));
        }
        self.log
            .info(format!("Connected clients count = {}", self.peers.len()));
    }

    fn on_read_request(&self, address: &str, request_id: u32, characteristic: Uuid, offset: usize) {
        if characteristic == WRITE_CHARACTERISTIC_UUID {
            let value = self.config.ready_response.as_bytes();
            let value = &value[offset.min(value.len())..];
            self.log.debug(format!("Read request from {}", address));
            self.respond(address, request_id, GattStatus::Success, Some(value));
        } else {
            self.respond(address, request_id, GattStatus::RequestNotSupported, None);
        }
    }

    fn on_write_request(
        &self,
        address: &str,
        request_id: u32,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    ) {
        if characteristic != WRITE_CHARACTERISTIC_UUID {
            if response_needed {
                self.respond(address, request_id, GattStatus::RequestNotSupported, None);
            }
            return;
        }

        if response_needed {
            self.respond(address, request_id, GattStatus::Success, None);
        }
        if value.is_empty() {
            self.log
                .warn(format!("Received empty write from {}", address));
            return;
        }
        self.log
            .callback()
            .on_message_received(&decode_message(&value));
    }

    fn on_descriptor_write(
        &self,
        address: &str,
        request_id: u32,
        descriptor: Uuid,
        value: &[u8],
        response_needed: bool,
    ) {
        if descriptor != NOTIFY_DESCRIPTOR_UUID {
            if response_needed {
                self.respond(address, request_id, GattStatus::RequestNotSupported, None);
            }
            return;
        }

        if value == ENABLE_NOTIFICATION_VALUE {
            self.subscribed.insert(address);
            self.log
                .info(format!("Notifications enabled for {}", address));
        } else {
            self.subscribed.remove(address);
            self.log
                .info(format!("Notifications disabled for {}", address));
        }
        if response_needed {
            self.respond(address, request_id, GattStatus::Success, None);
        }
    }

    fn on_adapter_state(&self, powered: bool) {
        let (advertiser, server, active) = {
            let mut inner = lock(&self.inner);
            inner.radio_enabled = powered;
            if powered {
                (None, None, inner.active)
            } else {
                (inner.advertiser.take(), inner.server.take(), inner.active)
            }
        };

        if active {
            self.log.info(if powered {
                "Bluetooth turned on."
            } else {
                "Bluetooth turned off."
            });
        }
        if powered && active {
            self.start_advertising();
        } else {
            self.release(advertiser, server);
        }
    }

    fn respond(&self, address: &str, request_id: u32, status: GattStatus, value: Option<&[u8]>) {
        let result = {
            let inner = lock(&self.inner);
            inner
                .server
                .as_ref()
                .map(|server| server.send_response(address, request_id, status, value))
        };
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => self
                .log
                .warn(format!("Failed to answer request {}: {}", request_id, e)),
            None => self
                .log
                .warn(format!("No GATT server to answer request {}", request_id)),
        }
    }

    /// Stop and close whatever was taken out of the slots, then forget the
    /// peers that were attached to them
    fn release(
        &self,
        advertiser: Option<Box<dyn AdvertisementHandle>>,
        server: Option<Box<dyn GattServer>>,
    ) {
        if let Some(advertiser) = advertiser {
            if let Err(e) = advertiser.stop() {
                self.log
                    .error(format!("Failed to stop advertising: {}", e));
            }
        }
        if let Some(server) = server {
            if let Err(e) = server.close() {
                self.log
                    .error(format!("Failed to close GATT server: {}", e));
            }
            self.peers.clear();
            self.subscribed.clear();
        }
    }
}

// ----------------------------------------------------------------------------
// Event Pump
// ----------------------------------------------------------------------------

/// Forward transport events into `link` until the channel closes or the link
/// is dropped
pub fn spawn_peripheral_event_pump(
    link: &Arc<PeripheralLink>,
    mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
) -> JoinHandle<()> {
    let link = Arc::downgrade(link);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(link) = link.upgrade() else {
                break;
            };
            link.handle_event(event);
        }
        tracing::debug!("Peripheral event pump ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeripheral, PeripheralCall, RecordingHost};
    use crate::protocol::{DISABLE_NOTIFICATION_VALUE, SERVICE_DATA_UUID};
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::identity::IDENTITY_KEY;

    struct Fixture {
        link: Arc<PeripheralLink>,
        transport: Arc<MockPeripheral>,
        host: Arc<RecordingHost>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.set(IDENTITY_KEY, "ABC123");
        let transport = Arc::new(MockPeripheral::new());
        let host = Arc::new(RecordingHost::new());
        let link = PeripheralLink::new(
            LinkConfig::default(),
            transport.clone(),
            IdentityStore::new(store),
            host.clone(),
        );
        Fixture {
            link,
            transport,
            host,
        }
    }

    fn connect(link: &PeripheralLink, address: &str) {
        link.handle_event(PeripheralEvent::ConnectionStateChanged {
            address: address.to_string(),
            connected: true,
        });
    }

    #[test]
    fn test_advertisement_carries_identity() {
        let f = fixture();
        f.link.start_advertising();

        assert!(f.link.is_advertising());
        let calls = f.transport.calls();
        let PeripheralCall::StartAdvertising { data } = &calls[0] else {
            panic!("expected advertising first, got {:?}", calls);
        };
        assert_eq!(data.service_data[&SERVICE_DATA_UUID], b"ABC123".to_vec());
        assert_eq!(calls[1], PeripheralCall::OpenServer);
        assert!(f.host.has_log(LogLevel::Info, "Device UniqueID = ABC123"));
    }

    #[test]
    fn test_unsupported_platform_fails_fast() {
        let f = fixture();
        f.transport.set_supported(false);
        f.link.start_advertising();

        assert!(f.transport.calls().is_empty());
        assert!(!f.link.is_active());
        assert!(f
            .host
            .has_log(LogLevel::Error, "BLE Advertising not supported on this device"));
    }

    #[test]
    fn test_connection_tracking() {
        let f = fixture();
        f.link.start_advertising();
        connect(&f.link, "A");
        connect(&f.link, "B");
        connect(&f.link, "A");
        assert_eq!(f.link.connected_peers(), vec!["A", "B"]);

        f.link.handle_event(PeripheralEvent::ConnectionStateChanged {
            address: "A".to_string(),
            connected: false,
        });
        assert_eq!(f.link.connected_peers(), vec!["B"]);
        assert!(f.host.has_log(LogLevel::Info, "Connected clients count = 1"));
    }

    #[test]
    fn test_broadcast_notifies_each_peer_once() {
        let f = fixture();
        f.link.start_advertising();
        connect(&f.link, "A");
        connect(&f.link, "B");

        f.link.send_message_to_all("ping");

        let mut notified = f.transport.notified();
        notified.sort();
        assert_eq!(notified, vec!["A", "B"]);
        assert!(f.transport.calls().contains(&PeripheralCall::SetValue {
            characteristic: NOTIFY_CHARACTERISTIC_UUID,
            value: b"ping".to_vec(),
        }));
    }

    #[test]
    fn test_broadcast_failure_for_one_peer_does_not_stop_others() {
        let f = fixture();
        f.link.start_advertising();
        connect(&f.link, "A");
        connect(&f.link, "B");
        f.transport.make_unreachable("A");

        f.link.send_message_to_all("ping");
        assert_eq!(f.transport.notified(), vec!["B"]);
        assert!(f.host.has_log(LogLevel::Warn, "Failed to notify A"));
    }

    #[test]
    fn test_read_probe_returns_ready_response() {
        let f = fixture();
        f.link.start_advertising();
        f.link.handle_event(PeripheralEvent::ReadRequest {
            address: "A".to_string(),
            request_id: 7,
            characteristic: WRITE_CHARACTERISTIC_UUID,
            offset: 0,
        });
        f.link.handle_event(PeripheralEvent::ReadRequest {
            address: "A".to_string(),
            request_id: 8,
            characteristic: NOTIFY_CHARACTERISTIC_UUID,
            offset: 0,
        });

        assert_eq!(
            f.transport.responses(),
            vec![
                (7, GattStatus::Success, Some(b"Server Ready".to_vec())),
                (8, GattStatus::RequestNotSupported, None),
            ]
        );
    }

    #[test]
    fn test_write_forwarded_with_empty_response() {
        let f = fixture();
        f.link.start_advertising();
        f.link.handle_event(PeripheralEvent::WriteRequest {
            address: "A".to_string(),
            request_id: 3,
            characteristic: WRITE_CHARACTERISTIC_UUID,
            value: b"hello".to_vec(),
            response_needed: true,
        });
        f.link.handle_event(PeripheralEvent::WriteRequest {
            address: "A".to_string(),
            request_id: 4,
            characteristic: WRITE_CHARACTERISTIC_UUID,
            value: b"again".to_vec(),
            response_needed: false,
        });

        assert_eq!(f.host.messages(), vec!["hello", "again"]);
        assert_eq!(f.transport.responses(), vec![(3, GattStatus::Success, None)]);
    }

    #[test]
    fn test_descriptor_write_toggles_subscription() {
        let f = fixture();
        f.link.start_advertising();
        let write = |value: &[u8]| {
            f.link.handle_event(PeripheralEvent::DescriptorWriteRequest {
                address: "A".to_string(),
                request_id: 1,
                descriptor: NOTIFY_DESCRIPTOR_UUID,
                value: value.to_vec(),
                response_needed: true,
            })
        };

        write(&ENABLE_NOTIFICATION_VALUE);
        assert!(f.link.is_subscribed("A"));
        write(&DISABLE_NOTIFICATION_VALUE);
        assert!(!f.link.is_subscribed("A"));
        write(&ENABLE_NOTIFICATION_VALUE);
        write(&[0x02, 0x00]);
        assert!(!f.link.is_subscribed("A"));
        assert_eq!(f.transport.responses().len(), 4);
    }

    #[test]
    fn test_stop_releases_both_slots_even_if_one_fails() {
        let f = fixture();
        f.link.start_advertising();
        connect(&f.link, "A");
        f.transport.fail_stop(true);

        f.link.stop_advertising();
        assert!(!f.link.is_advertising());
        assert!(f.link.connected_peers().is_empty());
        assert!(f.transport.calls().contains(&PeripheralCall::CloseServer));
        assert!(f.host.has_log(LogLevel::Error, "Failed to stop advertising"));

        // nothing left to broadcast through
        f.link.send_message_to_all("late");
        assert!(f.transport.notified().is_empty());
    }

    #[test]
    fn test_power_cycle_republishes() {
        let f = fixture();
        f.link.start_advertising();
        connect(&f.link, "A");

        f.link.handle_event(PeripheralEvent::AdapterStateChanged { powered: false });
        assert!(!f.link.is_advertising());
        assert_eq!(f.link.peer_count(), 0);

        f.link.handle_event(PeripheralEvent::AdapterStateChanged { powered: true });
        assert!(f.link.is_advertising());
        assert_eq!(f.transport.advertising_starts(), 2);
    }
}
