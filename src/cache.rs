//! # Open Group Cache
//!
//! Keeps recently used group data handles open so repeated operations on a
//! group avoid reopening and remapping its files. The cache is bounded by
//! entry count because every entry holds two file descriptors.
//!
//! ## Eviction
//!
//! Handles are shared as `Arc<Mutex<GroupData>>`. An entry whose `Arc` is
//! held only by the cache is idle; one also held by a live [`Search`] is
//! pinned. When the cache is full, the least recently used idle entry is
//! evicted:
//!
//! ```text
//! insert(g) with len == capacity
//!   idle entries?  -- yes --> evict the one with the oldest last_used
//!        |
//!        no --> sleep CACHE_EVICT_RETRY_DELAY_MS, retry up to
//!               CACHE_EVICT_RETRIES times (searches finish meanwhile)
//!        |
//!   still full --> hand back the handle without caching it
//! ```
//!
//! Evicting never invalidates a handle: a search that still holds the
//! `Arc` keeps the files open until it is dropped.
//!
//! ## Thread Safety
//!
//! `DataCache` is not internally synchronized; the `Tradindexed` façade
//! keeps it behind its state mutex.
//!
//! [`Search`]: crate::data::Search

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{CACHE_EVICT_RETRIES, CACHE_EVICT_RETRY_DELAY_MS};
use crate::data::{GroupData, SharedGroupData};
use crate::storage::GroupHash;

/// Hit statistics, reported when the overview is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub queries: u64,
    pub hits: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            return 0.0;
        }
        self.hits as f64 / self.queries as f64
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: SharedGroupData,
    last_used: u64,
}

impl CacheEntry {
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }
}

#[derive(Debug)]
pub struct DataCache {
    entries: HashMap<GroupHash, CacheEntry>,
    capacity: usize,
    clock: u64,
    queries: u64,
    hits: u64,
}

impl DataCache {
    /// Creates a cache holding at most `capacity` groups (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
            queries: 0,
            hits: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Returns the cached handle for `hash`, marking it most recently used.
    pub fn lookup(&mut self, hash: &GroupHash) -> Option<SharedGroupData> {
        self.queries += 1;
        let now = self.tick();
        let entry = self.entries.get_mut(hash)?;
        entry.last_used = now;
        self.hits += 1;
        Some(Arc::clone(&entry.data))
    }

    /// Caches `data` under `hash`, replacing any previous handle, and returns
    /// the shared handle.
    pub fn insert(&mut self, hash: GroupHash, data: GroupData) -> SharedGroupData {
        let shared = Arc::new(Mutex::new(data));
        self.entries.remove(&hash);

        if self.entries.len() >= self.capacity && !self.make_room() {
            warn!(
                capacity = self.capacity,
                group = %hash,
                "group cache full of active searches, not caching"
            );
            return shared;
        }

        let last_used = self.tick();
        self.entries.insert(
            hash,
            CacheEntry {
                data: Arc::clone(&shared),
                last_used,
            },
        );
        shared
    }

    fn make_room(&mut self) -> bool {
        for attempt in 0..=CACHE_EVICT_RETRIES {
            if self.evict_idle() {
                return true;
            }
            if attempt < CACHE_EVICT_RETRIES {
                thread::sleep(Duration::from_millis(CACHE_EVICT_RETRY_DELAY_MS));
            }
        }
        false
    }

    /// Evicts the least recently used idle entry.
    fn evict_idle(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_idle())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(hash, _)| *hash);

        match victim {
            Some(hash) => {
                if let Some(entry) = self.entries.remove(&hash) {
                    entry.data.lock().close();
                }
                debug!(group = %hash, "evicted group from cache");
                true
            }
            None => false,
        }
    }

    /// Drops the cached handle for `hash`. Searches holding it keep it open.
    pub fn remove(&mut self, hash: &GroupHash) -> bool {
        self.entries.remove(hash).is_some()
    }

    /// Drops every cached handle.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            queries: self.queries,
            hits: self.hits,
            entries: self.entries.len(),
            capacity: self.capacity,
        }
    }
}
