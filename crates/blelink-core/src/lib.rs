//! Connection lifecycle core for a two-role BLE text link
//!
//! One device either scans for and connects to a peer (central) or advertises
//! and serves one (peripheral), and the two exchange short UTF-8 messages over
//! a fixed GATT service. This crate holds everything above the raw radio:
//! identity persistence, the recent-peer directory, discovery sessions, the
//! reconnect loop, both link state machines and role switching.
//!
//! ## Architecture
//!
//! - [`identity`] - Persistent six-character device identifier
//! - [`directory`] - Bounded `peer_id -> address` map for reconnection
//! - [`scanner`] - Time-boxed, de-duplicated discovery sessions
//! - [`scheduler`] - Idempotent periodic reconnect driver
//! - [`central`] - Connect / discover / subscribe state machine
//! - [`peripheral`] - Advertising, GATT request handling and broadcast
//! - [`coordinator`] - Role switching and message routing
//! - [`transport`] - Radio primitive traits and their events
//! - [`sim`] - In-memory radio for tests and demos
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blelink_core::{
//!     sim::SimRadio, spawn_central_event_pump, spawn_peripheral_event_pump, LinkCallback,
//!     LinkConfig, LogLevel, MemoryStore, RoleCoordinator,
//! };
//!
//! struct Printer;
//!
//! impl LinkCallback for Printer {
//!     fn on_connected(&self) {}
//!     fn on_message_received(&self, text: &str) {
//!         println!("> {}", text);
//!     }
//!     fn on_log(&self, level: LogLevel, text: &str) {
//!         println!("[{}] {}", level.tag(), text);
//!     }
//! }
//!
//! # async fn example() {
//! let radio = SimRadio::new();
//! let (central, central_events) = radio.central("C0:00:00:00:00:01");
//! let (peripheral, peripheral_events) = radio.peripheral("P0:00:00:00:00:01");
//!
//! let coordinator = RoleCoordinator::build(
//!     LinkConfig::default(),
//!     central,
//!     peripheral,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(Printer),
//! );
//! spawn_central_event_pump(coordinator.central(), central_events);
//! spawn_peripheral_event_pump(coordinator.peripheral(), peripheral_events);
//!
//! coordinator.switch_to_central();
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod central;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod errors;
pub mod host;
pub mod identity;
pub mod peripheral;
pub mod protocol;
pub mod scanner;
pub mod scheduler;
pub mod sim;
pub mod storage;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod mock;

// Public API exports
pub use central::{spawn_central_event_pump, CentralLink, ConnectionState};
pub use config::LinkConfig;
pub use coordinator::{Role, RoleCoordinator};
pub use directory::{RecentPeerDirectory, RecentPeerEntry};
pub use errors::{LinkError, Result};
pub use host::{LinkCallback, LogLevel};
pub use identity::{DeviceIdentity, IdentityStore};
pub use peripheral::{spawn_peripheral_event_pump, PeerSet, PeripheralLink};
pub use protocol::{
    Advertisement, AdvertisementData, GattStatus, ServiceLayout, WriteType,
    NOTIFY_CHARACTERISTIC_UUID, NOTIFY_DESCRIPTOR_UUID, SERVICE_DATA_UUID, SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
pub use scanner::{DiscoveredPeer, Scanner};
pub use scheduler::ReconnectScheduler;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use timer::{CancelToken, ScheduledTask};
pub use transport::{
    AdvertisementHandle, CentralEvent, CentralTransport, ConnectionId, ConnectionOutcome,
    GattConnection, GattServer, PeripheralEvent, PeripheralTransport, ScanId,
};

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// Also used by the platform adapters and the terminal host.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
