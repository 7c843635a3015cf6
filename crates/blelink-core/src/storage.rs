//! Key/value persistence surface
//!
//! The identity and the recent-peer directory live in a simple string store.
//! Persistence is treated as always available: `FileStore` keeps serving from
//! memory when a disk write fails and reports the failure through `tracing`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::errors::Result;
use crate::lock;

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Process-wide string key/value store
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str);

    /// Delete the value stored under `key`
    fn remove(&self, key: &str);
}

// ----------------------------------------------------------------------------
// Memory Storage
// ----------------------------------------------------------------------------

/// In-memory store for tests and the simulated demo
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.data).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock(&self.data).insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        lock(&self.data).remove(key);
    }
}

// ----------------------------------------------------------------------------
// File Storage
// ----------------------------------------------------------------------------

/// JSON-object file store, written through on every mutation
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file is missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened key/value store at {} ({} keys)", path.display(), data.len());
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, data: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    fn persist(&self, data: &BTreeMap<String, String>) {
        if let Err(e) = self.flush(data) {
            warn!("Failed to persist store {}: {}", self.path.display(), e);
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.data).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut data = lock(&self.data);
        data.insert(key.to_string(), value.to_string());
        self.persist(&data);
    }

    fn remove(&self, key: &str) {
        let mut data = lock(&self.data);
        if data.remove(key).is_some() {
            self.persist(&data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k"), None);
        store.set("k", "v");
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.remove("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("unique_ble_device_id", "AB1C23");
            store.set("other", "x");
            store.remove("other");
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("unique_ble_device_id").as_deref(),
            Some("AB1C23")
        );
        assert_eq!(reopened.get("other"), None);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
