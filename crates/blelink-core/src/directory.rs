//! Recent peer directory
//!
//! Maps a peer's device identifier to the transport address it was last
//! connected at. A central consults it during discovery: a peer it has seen
//! before is reconnected immediately, anything else is surfaced to the host.
//!
//! Entries are kept in insertion order. Updating an existing peer replaces its
//! address in place without moving it, and trimming keeps the newest
//! `capacity` entries by that order, so a peer can be evicted even right after
//! a successful reconnect. A map written under a larger capacity is read back
//! through the same window, so lowering the capacity takes effect at once.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::storage::KeyValueStore;

/// Store key holding the JSON-encoded map
pub const RECENT_PEERS_KEY: &str = "recent_devices_map";

/// Default number of peers remembered
pub const DEFAULT_CAPACITY: usize = 5;

// ----------------------------------------------------------------------------
// Directory
// ----------------------------------------------------------------------------

/// One remembered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentPeerEntry {
    pub peer_id: String,
    pub address: String,
}

/// Persistent, bounded `peer_id -> address` map
#[derive(Clone)]
pub struct RecentPeerDirectory {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
}

impl RecentPeerDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
        }
    }

    /// Upsert `peer_id -> address`, then trim to the newest entries
    pub fn remember(&self, peer_id: &str, address: &str) {
        let mut map = self.load();
        map.insert(peer_id.to_string(), Value::String(address.to_string()));
        self.save(&self.newest(map));
        debug!("Remembered peer {} at {}", peer_id, address);
    }

    /// Last known address of `peer_id`
    pub fn address_for(&self, peer_id: &str) -> Option<String> {
        self.load()
            .get(peer_id)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Remembered identifiers, oldest first
    pub fn all_peer_ids(&self) -> Vec<String> {
        self.load().keys().cloned().collect()
    }

    /// Remembered peers, oldest first
    pub fn entries(&self) -> Vec<RecentPeerEntry> {
        self.load()
            .into_iter()
            .filter_map(|(peer_id, address)| {
                address.as_str().map(|address| RecentPeerEntry {
                    peer_id,
                    address: address.to_string(),
                })
            })
            .collect()
    }

    /// Forget every peer
    pub fn clear(&self) {
        self.store.remove(RECENT_PEERS_KEY);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn load(&self) -> Map<String, Value> {
        let Some(json) = self.store.get(RECENT_PEERS_KEY) else {
            return Map::new();
        };
        match serde_json::from_str::<Map<String, Value>>(&json) {
            Ok(map) => self.newest(map),
            Err(e) => {
                warn!("Discarding unreadable recent peer map: {}", e);
                Map::new()
            }
        }
    }

    fn newest(&self, map: Map<String, Value>) -> Map<String, Value> {
        let excess = map.len().saturating_sub(self.capacity);
        map.into_iter().skip(excess).collect()
    }

    fn save(&self, map: &Map<String, Value>) {
        match serde_json::to_string(map) {
            Ok(json) => self.store.set(RECENT_PEERS_KEY, &json),
            Err(e) => warn!("Failed to encode recent peer map: {}", e),
        }
    }
}
