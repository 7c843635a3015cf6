//! Per-installation device identifier
//!
//! Radio stacks rotate transport addresses for privacy, so a peripheral
//! publishes a short identifier in its advertisement that stays stable across
//! restarts. It is six characters (three distinct uppercase letters and three
//! distinct digits in random order) and is not guaranteed globally unique.

use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::protocol::DEVICE_ID_LEN;
use crate::storage::KeyValueStore;

/// Store key holding the identifier
pub const IDENTITY_KEY: &str = "unique_ble_device_id";

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// This installation's identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Generate a fresh identifier
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut letters: Vec<char> = ('A'..='Z').collect();
        letters.shuffle(rng);
        let mut digits: Vec<char> = ('0'..='9').collect();
        digits.shuffle(rng);

        let mut chars: Vec<char> = letters
            .into_iter()
            .take(3)
            .chain(digits.into_iter().take(3))
            .collect();
        chars.shuffle(rng);

        Self {
            id: chars.into_iter().collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Whether the identifier has the shape `generate` produces
    pub fn is_well_formed(&self) -> bool {
        self.id.len() == DEVICE_ID_LEN
            && self.id.chars().filter(|c| c.is_ascii_uppercase()).count() == 3
            && self.id.chars().filter(|c| c.is_ascii_digit()).count() == 3
    }
}

impl From<String> for DeviceIdentity {
    fn from(id: String) -> Self {
        Self { id }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// ----------------------------------------------------------------------------
// Identity Store
// ----------------------------------------------------------------------------

/// Produces and persists the device identifier
#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Return the persisted identifier, generating it on first use
    pub fn get_or_create_id(&self) -> String {
        if let Some(id) = self.store.get(IDENTITY_KEY) {
            return id;
        }

        let identity = DeviceIdentity::generate(&mut rand::thread_rng());
        self.store.set(IDENTITY_KEY, identity.as_str());
        info!("Generated device identifier {}", identity);
        identity.id
    }

    /// The identifier as a typed value
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::from(self.get_or_create_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_well_formed() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let identity = DeviceIdentity::generate(&mut rng);
            assert!(identity.is_well_formed(), "bad id {}", identity);

            let distinct: HashSet<char> = identity.as_str().chars().collect();
            assert_eq!(distinct.len(), DEVICE_ID_LEN);
        }
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let ids = IdentityStore::new(Arc::new(MemoryStore::new()));
        let first = ids.get_or_create_id();
        let second = ids.get_or_create_id();
        assert_eq!(first, second);
        assert!(ids.identity().is_well_formed());
    }

    #[test]
    fn test_existing_entry_is_never_regenerated() {
        let store = Arc::new(MemoryStore::new());
        store.set(IDENTITY_KEY, "legacy-id");
        let ids = IdentityStore::new(store);
        assert_eq!(ids.get_or_create_id(), "legacy-id");
    }

    #[test]
    fn test_independent_stores_differ() {
        let a = IdentityStore::new(Arc::new(MemoryStore::new())).get_or_create_id();
        let distinct = (0..8)
            .map(|_| IdentityStore::new(Arc::new(MemoryStore::new())).get_or_create_id())
            .filter(|b| *b != a)
            .count();
        // 26P3 * 10P3 * 6!/(3!3!) possible ids; eight draws all colliding is negligible
        assert!(distinct > 0);
    }
}
