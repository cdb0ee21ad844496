//! Platform storage abstraction.
//!
//! The connection monitor persists a single recovery flag across a full
//! context restart. The host platform's storage is an opaque key-value
//! store, so that is all this trait exposes.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

// ============================================================================
// RecoveryStore
// ============================================================================

/// Opaque key-value storage surviving a context teardown.
///
/// Implementations wrap whatever the host platform provides. Only the
/// connection monitor writes through this trait.
pub trait RecoveryStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a value.
    fn set(&self, key: &str, value: &str);

    /// Removes a value.
    fn remove(&self, key: &str);
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory store for tests and same-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<FxHashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecoveryStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

// ============================================================================
// Tests
// ============================================================================
