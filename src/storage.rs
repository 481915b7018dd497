//! Local value storage.
//!
//! The node only needs `get`/`store`/`keys`/`remove` from its value store;
//! durability is the implementation's business. [`MemoryStore`] keeps
//! everything in an LRU cache bounded by entry count.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::kuid::Kuid;

/// Default number of entries held by a [`MemoryStore`].
pub const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Default upper bound for a single stored value (64 KiB).
pub const DEFAULT_MAX_VALUE_BYTES: usize = 64 * 1024;

/// Result of a local or remote STORE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Stored,
    Rejected,
}

impl StoreStatus {
    pub fn is_stored(self) -> bool {
        matches!(self, StoreStatus::Stored)
    }
}

/// Key/value persistence consumed by the STORE handler, FIND_VALUE handler
/// and the sync round.
pub trait ValueStore: Send + 'static {
    /// Read a value. Takes `&mut self` so caches can update recency.
    fn get(&mut self, key: &Kuid) -> Option<Bytes>;

    fn store(&mut self, key: Kuid, value: Bytes) -> StoreStatus;

    /// Snapshot of the keys currently held.
    fn keys(&self) -> Vec<Kuid>;

    fn remove(&mut self, key: &Kuid) -> Option<Bytes>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate payload size in bytes.
    fn stored_bytes(&self) -> usize;
}

/// Value store shared between the node's handlers and coordinators.
pub type SharedValueStore = Arc<Mutex<dyn ValueStore>>;

/// In-memory LRU value store.
///
/// When full, storing a new key evicts the least recently used entry. Values
/// above `max_value_bytes` are rejected.
pub struct MemoryStore {
    entries: LruCache<Kuid, Bytes>,
    max_value_bytes: usize,
    bytes: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            bytes: 0,
        }
    }

    pub fn with_max_value_bytes(mut self, max_value_bytes: usize) -> Self {
        self.max_value_bytes = max_value_bytes;
        self
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

impl ValueStore for MemoryStore {
    fn get(&mut self, key: &Kuid) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: Kuid, value: Bytes) -> StoreStatus {
        if value.len() > self.max_value_bytes {
            return StoreStatus::Rejected;
        }
        self.bytes += value.len();
        // `push` hands back either the previous value for this key or the
        // evicted LRU entry.
        if let Some((_, displaced)) = self.entries.push(key, value) {
            self.bytes -= displaced.len();
        }
        StoreStatus::Stored
    }

    fn keys(&self) -> Vec<Kuid> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    fn remove(&mut self, key: &Kuid) -> Option<Bytes> {
        let removed = self.entries.pop(key)?;
        self.bytes -= removed.len();
        Some(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stored_bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Kuid {
        Kuid::from_bytes(vec![byte; 20])
    }

    #[test]
    fn store_and_get_roundtrip() {
        let mut store = MemoryStore::default();
        assert_eq!(store.store(key(1), Bytes::from_static(b"hello")), StoreStatus::Stored);
        assert_eq!(store.get(&key(1)).as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.stored_bytes(), 5);
        assert!(store.get(&key(2)).is_none());
    }

    #[test]
    fn overwrite_keeps_byte_accounting() {
        let mut store = MemoryStore::default();
        store.store(key(1), Bytes::from_static(b"hello"));
        store.store(key(1), Bytes::from_static(b"hi"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.stored_bytes(), 2);
        assert_eq!(store.remove(&key(1)).as_deref(), Some(&b"hi"[..]));
        assert_eq!(store.stored_bytes(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn full_store_evicts_least_recently_used() {
        let mut store = MemoryStore::new(2);
        store.store(key(1), Bytes::from_static(b"a"));
        store.store(key(2), Bytes::from_static(b"bb"));
        // Touch key 1 so key 2 becomes the eviction candidate.
        store.get(&key(1));
        store.store(key(3), Bytes::from_static(b"ccc"));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec![key(1), key(3)]);
        assert_eq!(store.stored_bytes(), 4);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut store = MemoryStore::default().with_max_value_bytes(4);
        assert_eq!(store.store(key(1), Bytes::from_static(b"too long")), StoreStatus::Rejected);
        assert!(store.is_empty());
    }
}
