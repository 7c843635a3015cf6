//! Role switching between central and peripheral
//!
//! One device plays one role at a time. Switching tears the other role down
//! before bringing the requested one up, and outbound messages go to whichever
//! link matches the current role.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::central::CentralLink;
use crate::config::LinkConfig;
use crate::directory::RecentPeerDirectory;
use crate::host::{HostLog, LinkCallback};
use crate::identity::IdentityStore;
use crate::lock;
use crate::peripheral::PeripheralLink;
use crate::storage::KeyValueStore;
use crate::transport::{CentralEvent, CentralTransport, PeripheralEvent, PeripheralTransport};

/// The role this device currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::None => "none",
            Role::Central => "client",
            Role::Peripheral => "server",
        };
        f.write_str(name)
    }
}

/// Owns both links and routes host requests to the active one
pub struct RoleCoordinator {
    central: Arc<CentralLink>,
    peripheral: Arc<PeripheralLink>,
    log: HostLog,
    role: Mutex<Role>,
}

impl RoleCoordinator {
    pub fn new(
        central: Arc<CentralLink>,
        peripheral: Arc<PeripheralLink>,
        callback: Arc<dyn LinkCallback>,
    ) -> Self {
        Self {
            central,
            peripheral,
            log: HostLog::new(callback, "coordinator"),
            role: Mutex::new(Role::None),
        }
    }

    /// Wire both links over a single store
    pub fn build(
        config: LinkConfig,
        central_transport: Arc<dyn CentralTransport>,
        peripheral_transport: Arc<dyn PeripheralTransport>,
        store: Arc<dyn KeyValueStore>,
        callback: Arc<dyn LinkCallback>,
    ) -> Self {
        let directory = RecentPeerDirectory::with_capacity(store.clone(), config.recent_peer_capacity);
        let central = CentralLink::new(
            config.clone(),
            central_transport,
            directory,
            callback.clone(),
        );
        let peripheral = PeripheralLink::new(
            config,
            peripheral_transport,
            IdentityStore::new(store),
            callback.clone(),
        );
        Self::new(central, peripheral, callback)
    }

    pub fn role(&self) -> Role {
        *lock(&self.role)
    }

    pub fn central(&self) -> &Arc<CentralLink> {
        &self.central
    }

    pub fn peripheral(&self) -> &Arc<PeripheralLink> {
        &self.peripheral
    }

    /// Stop serving and start scanning for peripherals
    pub fn switch_to_central(&self) {
        if self.peripheral.is_active() {
            self.peripheral.stop_advertising();
        }
        *lock(&self.role) = Role::Central;
        self.central.activate();
        self.log.info("--Your device is now Client--");
    }

    /// Stop scanning and reconnecting, then start serving
    pub fn switch_to_peripheral(&self) {
        if self.central.is_active() {
            self.central.deactivate();
        }
        *lock(&self.role) = Role::Peripheral;
        self.peripheral.start_advertising();
        self.log.info("--Your device is now Server--");
    }

    /// Manually connect to a discovered peer; only meaningful as central
    pub fn connect(&self, address: &str, peer_id: &str) {
        match self.role() {
            Role::Central => self.central.connect(address, peer_id),
            _ => self
                .log
                .warn("Switch to Client before connecting to a device"),
        }
    }

    /// Send `text` through the link of the current role
    pub fn send_message(&self, text: &str) {
        match self.role() {
            Role::Central => self.central.send_message(text),
            Role::Peripheral => self.peripheral.send_message_to_all(text),
            Role::None => self.log.warn("Choose Client or Server"),
        }
    }

    /// Forward a radio power change to both links; only the active one acts
    pub fn handle_adapter_state(&self, powered: bool) {
        self.central
            .handle_event(CentralEvent::AdapterStateChanged { powered });
        self.peripheral
            .handle_event(PeripheralEvent::AdapterStateChanged { powered });
    }

    /// Tear down whichever role is active
    pub fn shutdown(&self) {
        if self.central.is_active() {
            self.central.deactivate();
        }
        if self.peripheral.is_active() {
            self.peripheral.stop_advertising();
        }
        *lock(&self.role) = Role::None;
        self.log.debug("Link shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LogLevel;
    use crate::mock::{MockCentral, MockPeripheral, RecordingHost};
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use tokio::time;

    struct Fixture {
        coordinator: RoleCoordinator,
        central: Arc<MockCentral>,
        peripheral: Arc<MockPeripheral>,
        host: Arc<RecordingHost>,
    }

    fn fixture() -> Fixture {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new());
        let host = Arc::new(RecordingHost::new());
        let coordinator = RoleCoordinator::build(
            LinkConfig::default(),
            central.clone(),
            peripheral.clone(),
            Arc::new(MemoryStore::new()),
            host.clone(),
        );
        Fixture {
            coordinator,
            central,
            peripheral,
            host,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_role_is_rejected() {
        let f = fixture();
        f.coordinator.send_message("hello");

        assert_eq!(f.coordinator.role(), Role::None);
        assert!(f.host.has_log(LogLevel::Warn, "Choose Client or Server"));
        assert!(f.central.writes().is_empty());
        assert!(f.peripheral.notified().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_roles_tears_down_the_other() {
        let f = fixture();
        f.coordinator.switch_to_peripheral();
        assert!(f.coordinator.peripheral().is_advertising());
        assert!(f.host.has_log(LogLevel::Info, "--Your device is now Server--"));

        f.coordinator.switch_to_central();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(f.coordinator.role(), Role::Central);
        assert!(!f.coordinator.peripheral().is_advertising());
        assert!(f.coordinator.central().is_scanning());

        f.coordinator.switch_to_peripheral();
        assert!(!f.coordinator.central().is_active());
        assert!(!f.coordinator.central().is_reconnecting());
        let scans = f.central.scan_count();
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.central.scan_count(), scans);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_central_role() {
        let f = fixture();
        f.coordinator.connect("X", "ABC123");
        assert_eq!(f.central.connect_count(), 0);

        f.coordinator.switch_to_central();
        f.coordinator.connect("X", "ABC123");
        assert_eq!(f.central.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_to_no_role() {
        let f = fixture();
        f.coordinator.switch_to_peripheral();
        f.coordinator.shutdown();

        assert_eq!(f.coordinator.role(), Role::None);
        assert!(!f.coordinator.peripheral().is_advertising());
    }
}
