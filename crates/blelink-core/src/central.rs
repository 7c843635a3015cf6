//! Central role: scan, connect, subscribe, reconnect
//!
//! The link owns at most one outbound connection and walks it through
//! `Idle -> Connecting -> Discovering -> Subscribing -> Ready`. Each transport
//! event kind has one transition handler, and an event is applied only when it
//! belongs to the connection in the slot and the state it expects is current;
//! anything else is logged and dropped. Any failure or disconnect tears the
//! connection down to `Idle` and re-arms the reconnect loop.
//!
//! While disconnected, the reconnect loop runs a short discovery scan every
//! interval. Peers found in the recent-peer directory are reconnected at once;
//! unknown peers are handed to the host for manual selection.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::directory::{RecentPeerDirectory, RecentPeerEntry};
use crate::host::{HostLog, LinkCallback, LogLevel, Outbox};
use crate::lock;
use crate::protocol::{
    decode_message, encode_message, Advertisement, ServiceLayout, WriteType,
    ENABLE_NOTIFICATION_VALUE, NOTIFY_CHARACTERISTIC_UUID, NOTIFY_DESCRIPTOR_UUID, SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
use crate::scanner::{DiscoveredPeer, Scanner};
use crate::scheduler::ReconnectScheduler;
use crate::timer::ScheduledTask;
use crate::transport::{
    CentralEvent, CentralTransport, ConnectionId, ConnectionOutcome, GattConnection,
};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Progress of the single outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Discovering,
    Subscribing,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Internal State
// ----------------------------------------------------------------------------

struct ActiveConnection {
    handle: Box<dyn GattConnection>,
    peer_id: String,
    address: String,
    started_at: Instant,
    write_characteristic: Option<Uuid>,
}

struct CentralInner {
    state: ConnectionState,
    slot: Option<ActiveConnection>,
    active: bool,
    radio_enabled: bool,
    pending_writes: Vec<ScheduledTask>,
}

impl CentralInner {
    fn owns(&self, connection: ConnectionId) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.handle.id() == connection)
    }
}

// ----------------------------------------------------------------------------
// Central Link
// ----------------------------------------------------------------------------

/// Owns the central side of the link
pub struct CentralLink {
    me: Weak<CentralLink>,
    config: LinkConfig,
    transport: Arc<dyn CentralTransport>,
    directory: RecentPeerDirectory,
    scanner: Scanner,
    reconnect: ReconnectScheduler,
    log: HostLog,
    inner: Mutex<CentralInner>,
}

impl CentralLink {
    pub fn new(
        config: LinkConfig,
        transport: Arc<dyn CentralTransport>,
        directory: RecentPeerDirectory,
        callback: Arc<dyn LinkCallback>,
    ) -> Arc<Self> {
        let log = HostLog::new(callback, "central");
        let radio_enabled = transport.is_enabled();

        Arc::new_cyclic(|me: &Weak<CentralLink>| {
            let tick = me.clone();
            let reconnect = ReconnectScheduler::new(config.reconnect_interval, move || {
                if let Some(link) = tick.upgrade() {
                    link.try_reconnect();
                }
            });

            Self {
                me: me.clone(),
                scanner: Scanner::new(transport.clone(), log.clone()),
                config,
                transport,
                directory,
                reconnect,
                log,
                inner: Mutex::new(CentralInner {
                    state: ConnectionState::Idle,
                    slot: None,
                    active: false,
                    radio_enabled,
                    pending_writes: Vec::new(),
                }),
            }
        })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Start the reconnect loop; its first scan runs immediately
    pub fn activate(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.active = true;
            inner.radio_enabled = self.transport.is_enabled();
        }
        self.log.debug("Central role activated");
        self.reconnect.start();
    }

    /// Stop the loop and any scan, and drop the active connection
    pub fn deactivate(&self) {
        let mut out = Outbox::default();
        {
            let mut inner = lock(&self.inner);
            inner.active = false;
            if inner.slot.is_some() {
                self.teardown(&mut inner, &mut out, true);
            }
        }
        // a tick already past its checks sees `active == false` once its
        // scan is up and stops it again
        self.reconnect.stop();
        self.scanner.stop_scan();
        out.deliver(&self.log);
        self.log.debug("Central role deactivated");
    }

    /// Connect to `address`, expecting the peer that advertises `peer_id`
    pub fn connect(&self, address: &str, peer_id: &str) {
        let mut out = Outbox::default();
        {
            let mut inner = lock(&self.inner);
            if !inner.radio_enabled || !self.transport.is_enabled() {
                out.log(LogLevel::Warn, format!("Bluetooth is off, not connecting to {}", address));
            } else if inner.state != ConnectionState::Idle {
                out.log(
                    LogLevel::Debug,
                    format!("Already {}, ignoring connect to {}", inner.state, address),
                );
            } else {
                match self.transport.connect(address) {
                    Ok(handle) => {
                        inner.slot = Some(ActiveConnection {
                            handle,
                            peer_id: peer_id.to_string(),
                            address: address.to_string(),
                            started_at: Instant::now(),
                            write_characteristic: None,
                        });
                        inner.state = ConnectionState::Connecting;
                        out.log(LogLevel::Info, format!("Trying to connect to {}", address));
                    }
                    Err(e) => {
                        out.log(LogLevel::Error, format!("Connect failed: {}", e));
                        if inner.active {
                            self.reconnect.start();
                        }
                    }
                }
            }
        }
        out.deliver(&self.log);
    }

    /// Queue `text` for the peripheral; the write goes out after the
    /// configured delay
    pub fn send_message(&self, text: &str) {
        let mut out = Outbox::default();
        {
            let mut inner = lock(&self.inner);
            let target = inner.slot.as_ref().and_then(|slot| {
                slot.write_characteristic
                    .map(|characteristic| (slot.handle.id(), characteristic))
            });

            match target {
                None => out.log(LogLevel::Error, "Characteristic not found for writing"),
                Some((connection, characteristic)) => {
                    let payload = encode_message(text);
                    let link = self.me.clone();
                    let write = ScheduledTask::once(self.config.write_delay, move || {
                        if let Some(link) = link.upgrade() {
                            link.write_now(connection, characteristic, payload);
                        }
                    });
                    inner.pending_writes.retain(ScheduledTask::is_active);
                    inner.pending_writes.push(write);
                    out.log(LogLevel::Info, format!("Sending message: {}", text));
                }
            }
        }
        out.deliver(&self.log);
    }

    /// Feed one transport event through the state machine
    pub fn handle_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::Advertisement(advertisement) => self.on_advertisement(&advertisement),
            CentralEvent::ScanFailed { scan, reason } => {
                self.scanner.handle_scan_failed(scan, &reason)
            }
            CentralEvent::ConnectionStateChanged {
                connection,
                address,
                outcome,
            } => self.on_connection_state(connection, &address, outcome),
            CentralEvent::ServicesDiscovered { connection, result } => {
                self.on_services_discovered(connection, result)
            }
            CentralEvent::DescriptorWritten {
                connection,
                descriptor,
                result,
            } => self.on_descriptor_written(connection, descriptor, result),
            CentralEvent::CharacteristicWritten {
                connection,
                characteristic,
                result,
            } => self.on_characteristic_written(connection, characteristic, result),
            CentralEvent::Notification {
                connection,
                characteristic,
                value,
            } => self.on_notification(connection, characteristic, value),
            CentralEvent::AdapterStateChanged { powered } => self.on_adapter_state(powered),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    /// Whether the link is subscribed and usable
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).active
    }

    /// Peer occupying the connection slot, ready or not
    pub fn connected_peer(&self) -> Option<DiscoveredPeer> {
        lock(&self.inner).slot.as_ref().map(|slot| DiscoveredPeer {
            address: slot.address.clone(),
            peer_id: slot.peer_id.clone(),
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_running()
    }

    pub fn recent_peers(&self) -> Vec<RecentPeerEntry> {
        self.directory.entries()
    }

    pub fn clear_recent_peers(&self) {
        self.directory.clear();
        self.log.info("Cleared recent devices");
    }

    // ------------------------------------------------------------------------
    // Reconnect Loop
    // ------------------------------------------------------------------------

    fn try_reconnect(&self) {
        {
            let inner = lock(&self.inner);
            if !inner.active || !inner.radio_enabled || inner.state != ConnectionState::Idle {
                return;
            }
        }
        if !self.transport.is_enabled() {
            return;
        }

        self.log.info("Attempting reconnect via scan...");
        self.scanner.start_scan(self.config.scan_duration);

        if !self.is_active() {
            self.scanner.stop_scan();
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn on_advertisement(&self, advertisement: &Advertisement) {
        let Some(peer) = self.scanner.handle_advertisement(advertisement) else {
            return;
        };

        let (active, state) = {
            let inner = lock(&self.inner);
            (inner.active, inner.state)
        };
        if !active {
            self.scanner.stop_scan();
            return;
        }

        if self.directory.address_for(&peer.peer_id).is_some() {
            if state != ConnectionState::Idle {
                self.log.debug(format!(
                    "Already {}, not auto-connecting to {}",
                    state, peer.address
                ));
                return;
            }
            self.log.info(format!(
                "Auto-connecting to recent device: {} ({})",
                peer.address, peer.peer_id
            ));
            self.scanner.stop_scan();
            self.connect(&peer.address, &peer.peer_id);
        } else {
            self.log.callback().on_peer_discovered(&peer);
        }
    }

    fn on_connection_state(&self, connection: ConnectionId, address: &str, outcome: ConnectionOutcome) {
        let mut out = Outbox::default();
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            if !inner.owns(connection) {
                out.log(
                    LogLevel::Debug,
                    format!("Ignoring {:?} for stale {}", outcome, connection),
                );
            } else {
                match outcome {
                    ConnectionOutcome::Connected => {
                        self.on_connected(inner, &mut out, address);
                    }
                    ConnectionOutcome::Disconnected => {
                        out.log(LogLevel::Info, "Disconnected from GATT server.");
                        self.teardown(inner, &mut out, false);
                    }
                    ConnectionOutcome::Failed(reason) => {
                        out.log(LogLevel::Error, format!("Connection failed: {}", reason));
                        self.teardown(inner, &mut out, false);
                    }
                }
            }
        }
        out.deliver(&self.log);
    }

    fn on_connected(&self, inner: &mut CentralInner, out: &mut Outbox, address: &str) {
        if inner.state != ConnectionState::Connecting {
            out.log(
                LogLevel::Debug,
                format!("Ignoring connect event while {}", inner.state),
            );
            return;
        }
        let Some(slot) = inner.slot.as_mut() else {
            return;
        };

        self.reconnect.stop();
        slot.address = address.to_string();
        out.log(
            LogLevel::Info,
            format!("Connected in {} ms", slot.started_at.elapsed().as_millis()),
        );
        self.directory.remember(&slot.peer_id, &slot.address);

        match slot.handle.discover_services() {
            Ok(()) => inner.state = ConnectionState::Discovering,
            Err(e) => {
                out.log(LogLevel::Warn, format!("Service discovery failed: {}", e));
                self.teardown(inner, out, true);
            }
        }
    }

    fn on_services_discovered(
        &self,
        connection: ConnectionId,
        result: std::result::Result<Vec<ServiceLayout>, String>,
    ) {
        let mut out = Outbox::default();
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            if !inner.owns(connection) || inner.state != ConnectionState::Discovering {
                out.log(
                    LogLevel::Debug,
                    format!("Ignoring service discovery for {} while {}", connection, inner.state),
                );
            } else {
                match result {
                    Ok(services) => self.subscribe(inner, &mut out, &services),
                    Err(reason) => {
                        out.log(LogLevel::Warn, format!("Service discovery failed: {}", reason));
                        self.teardown(inner, &mut out, true);
                    }
                }
            }
        }
        out.deliver(&self.log);
    }

    fn subscribe(&self, inner: &mut CentralInner, out: &mut Outbox, services: &[ServiceLayout]) {
        let Some(service) = services.iter().find(|s| s.uuid == SERVICE_UUID) else {
            out.log(LogLevel::Error, "Service not found");
            return self.teardown(inner, out, true);
        };
        let Some(slot) = inner.slot.as_mut() else {
            return;
        };

        match service.characteristic(WRITE_CHARACTERISTIC_UUID) {
            Some(write) => {
                slot.write_characteristic = Some(write.uuid);
                out.log(LogLevel::Debug, "Write characteristic found");
            }
            None => out.log(
                LogLevel::Error,
                "Write characteristic not found, link will be receive-only",
            ),
        }

        let Some(notify) = service.characteristic(NOTIFY_CHARACTERISTIC_UUID) else {
            out.log(LogLevel::Error, "Notify characteristic not found");
            return self.teardown(inner, out, true);
        };
        out.log(
            LogLevel::Debug,
            format!("Notify characteristic notifiable = {}", notify.properties.notify),
        );
        if !notify.properties.notify {
            out.log(LogLevel::Error, "Notify characteristic is not notifiable");
            return self.teardown(inner, out, true);
        }

        match slot.handle.set_notifications(notify.uuid, true) {
            Ok(()) => out.log(LogLevel::Debug, "Local notification delivery enabled"),
            Err(e) => out.log(
                LogLevel::Warn,
                format!("Failed to enable local notification delivery: {}", e),
            ),
        }

        if !notify.has_descriptor(NOTIFY_DESCRIPTOR_UUID) {
            out.log(LogLevel::Error, "Descriptor not found on notify characteristic");
            return self.teardown(inner, out, true);
        }

        match slot.handle.write_descriptor(
            notify.uuid,
            NOTIFY_DESCRIPTOR_UUID,
            &ENABLE_NOTIFICATION_VALUE,
        ) {
            Ok(()) => {
                out.log(LogLevel::Debug, "Descriptor write initiated");
                inner.state = ConnectionState::Subscribing;
            }
            Err(e) => {
                out.log(LogLevel::Warn, format!("Descriptor write failed: {}", e));
                self.teardown(inner, out, true);
            }
        }
    }

    fn on_descriptor_written(
        &self,
        connection: ConnectionId,
        descriptor: Uuid,
        result: std::result::Result<(), String>,
    ) {
        let mut out = Outbox::default();
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            if !inner.owns(connection)
                || inner.state != ConnectionState::Subscribing
                || descriptor != NOTIFY_DESCRIPTOR_UUID
            {
                out.log(
                    LogLevel::Debug,
                    format!("Ignoring descriptor write for {} while {}", connection, inner.state),
                );
            } else {
                match result {
                    Ok(()) => {
                        inner.state = ConnectionState::Ready;
                        if let Some(slot) = inner.slot.as_ref() {
                            out.log(
                                LogLevel::Info,
                                format!("Subscribed to {} at {}", slot.peer_id, slot.address),
                            );
                        }
                        out.connected();
                    }
                    Err(reason) => {
                        out.log(LogLevel::Error, format!("Descriptor write failed: {}", reason));
                        self.teardown(inner, &mut out, true);
                    }
                }
            }
        }
        out.deliver(&self.log);
    }

    fn on_characteristic_written(
        &self,
        connection: ConnectionId,
        characteristic: Uuid,
        result: std::result::Result<(), String>,
    ) {
        if !lock(&self.inner).owns(connection) {
            return;
        }
        match result {
            Ok(()) => self
                .log
                .debug(format!("Message sent to server via {}", characteristic)),
            Err(reason) => self.log.warn(format!("Message write failed: {}", reason)),
        }
    }

    fn on_notification(&self, connection: ConnectionId, characteristic: Uuid, value: Vec<u8>) {
        let mut out = Outbox::default();
        {
            let inner = lock(&self.inner);
            let subscribed = matches!(
                inner.state,
                ConnectionState::Subscribing | ConnectionState::Ready
            );
            if !inner.owns(connection) || !subscribed || characteristic != NOTIFY_CHARACTERISTIC_UUID {
                return;
            }
        }

        if value.is_empty() {
            out.log(LogLevel::Warn, "Received empty characteristic value");
        } else {
            out.message(decode_message(&value));
        }
        out.deliver(&self.log);
    }

    fn on_adapter_state(&self, powered: bool) {
        if !powered {
            self.scanner.stop_scan();
        }

        let mut out = Outbox::default();
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            inner.radio_enabled = powered;
            if powered {
                if inner.active {
                    out.log(LogLevel::Info, "Bluetooth turned on.");
                }
                if inner.active && inner.state == ConnectionState::Idle {
                    self.reconnect.stop();
                    self.reconnect.start();
                }
            } else {
                if inner.active {
                    out.log(LogLevel::Info, "Bluetooth turned off.");
                }
                if inner.slot.is_some() {
                    self.teardown(inner, &mut out, false);
                }
            }
        }
        out.deliver(&self.log);
    }

    fn write_now(&self, connection: ConnectionId, characteristic: Uuid, payload: Vec<u8>) {
        let mut out = Outbox::default();
        {
            let inner = lock(&self.inner);
            match inner.slot.as_ref() {
                Some(slot) if slot.handle.id() == connection => {
                    match slot.handle.write_characteristic(
                        characteristic,
                        &payload,
                        WriteType::WithoutResponse,
                    ) {
                        Ok(()) => out.log(LogLevel::Debug, "Write initiated = true"),
                        Err(e) => out.log(LogLevel::Warn, format!("Write initiated = false ({})", e)),
                    }
                }
                _ => out.log(
                    LogLevel::Warn,
                    "Connection closed before the message could be written",
                ),
            }
        }
        out.deliver(&self.log);
    }

    /// Release the slot, return to `Idle` and re-arm the loop if active
    fn teardown(&self, inner: &mut CentralInner, out: &mut Outbox, disconnect: bool) {
        if let Some(slot) = inner.slot.take() {
            if disconnect {
                if let Err(e) = slot.handle.disconnect() {
                    out.log(LogLevel::Warn, format!("Error disconnecting GATT: {}", e));
                }
            }
            if let Err(e) = slot.handle.close() {
                out.log(LogLevel::Error, format!("Error closing GATT: {}", e));
            }
        }
        inner.state = ConnectionState::Idle;
        inner.pending_writes.clear();

        if inner.active && inner.radio_enabled {
            self.reconnect.start();
            out.log(LogLevel::Warn, "Attempting reconnection...");
        }
    }
}

// ----------------------------------------------------------------------------
// Event Pump
// ----------------------------------------------------------------------------

/// Forward transport events into `link` until the channel closes or the link
/// is dropped
pub fn spawn_central_event_pump(
    link: &Arc<CentralLink>,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
) -> JoinHandle<()> {
    let link = Arc::downgrade(link);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(link) = link.upgrade() else {
                break;
            };
            link.handle_event(event);
        }
        tracing::debug!("Central event pump ended");
    })
}
