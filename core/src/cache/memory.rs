//! Bounded in-process cache tier with least-recently-accessed eviction.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::cache::CacheEntry;
use crate::key::RequestKey;

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

/// In-memory cache tier.
///
/// Not internally synchronized; the dispatcher keeps it inside the same
/// lock as its in-flight table so lookups and inserts are part of one
/// decision. Recency is a logical counter, not wall time, so two accesses
/// never tie.
pub struct MemoryCache {
    capacity: usize,
    entries: HashMap<RequestKey, Slot>,
    clock: u64,
    max_age: Option<chrono::Duration>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            clock: 0,
            max_age: None,
        }
    }

    /// Treat entries stored longer than `max_age` ago as misses, matching
    /// the persistent tier's limit.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = chrono::Duration::from_std(max_age).ok();
        self
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up an entry and mark it as most recently accessed.
    /// Over-age entries are removed and reported as misses.
    pub fn get(&mut self, key: &RequestKey) -> Option<&CacheEntry> {
        let now = self.tick();
        if let Some(max_age) = self.max_age {
            let over_age = self
                .entries
                .get(key)
                .is_some_and(|slot| slot.entry.is_over_age(max_age, Utc::now()));
            if over_age {
                self.entries.remove(key);
                return None;
            }
        }
        let slot = self.entries.get_mut(key)?;
        slot.last_access = now;
        Some(&slot.entry)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key).map(|slot| &slot.entry)
    }

    /// Insert or replace. When a new key arrives at capacity, exactly the
    /// least-recently-accessed entry is evicted first and its key returned.
    pub fn put(&mut self, entry: CacheEntry) -> Option<RequestKey> {
        if self.capacity == 0 {
            return None;
        }
        let now = self.tick();
        let mut evicted = None;
        if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
                evicted = Some(key);
            }
        }
        self.entries.insert(
            entry.key.clone(),
            Slot {
                entry,
                last_access: now,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &RequestKey) -> Option<CacheEntry> {
        self.entries.remove(key).map(|slot| slot.entry)
    }

    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
