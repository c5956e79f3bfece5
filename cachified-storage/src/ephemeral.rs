//! Ephemeral tier: a bounded, process-local LRU map.
//!
//! Entries are stored type-erased so one tier can hold every value type the
//! process caches. Expiry is enforced lazily on read in addition to LRU
//! eviction once the capacity bound is exceeded.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachified_core::{CacheEntry, CacheMetadata, EntryState};
use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::lock::mutex_lock;

const SOURCE: &str = "cachified::ephemeral";

struct EphemeralEntry {
    value: Arc<dyn Any + Send + Sync>,
    metadata: CacheMetadata,
}

/// In-process LRU tier shared by every request in one process.
pub struct EphemeralTier {
    entries: Mutex<LruCache<String, EphemeralEntry>>,
    evictions: AtomicU64,
}

impl EphemeralTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a tier holding at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    /// Look up `key` as of `now`.
    ///
    /// Returns `None` for absent keys, for expired entries (which are removed),
    /// and for entries stored under a different value type.
    pub fn get<T>(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let entry = entries.get(key)?;
        if entry.metadata.state(now) == EntryState::Expired {
            entries.pop(key);
            return None;
        }
        let value = entry.value.downcast_ref::<T>()?.clone();
        Some(CacheEntry::new(value, entry.metadata))
    }

    /// Insert or replace `key`, evicting the least-recently-used entry when full.
    pub fn set<T>(&self, key: impl Into<String>, entry: CacheEntry<T>)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let stored = EphemeralEntry {
            value: Arc::new(entry.value),
            metadata: entry.metadata,
        };
        let mut entries = mutex_lock(&self.entries, SOURCE, "set");
        if let Some((evicted, _)) = entries.push(key.clone(), stored) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        mutex_lock(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "capacity").cap().get()
    }

    /// Number of entries dropped to make room for new ones.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }
}

impl std::fmt::Debug for EphemeralTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralTier")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("evictions", &self.evictions())
            .finish()
    }
}
