//! Bounded response cache.
//!
//! Entries are keyed by object key and encoding variant and weighted by the
//! byte length of their prepared body. The total weight never exceeds the
//! configured capacity: least recently used entries are evicted first. Entries
//! are immutable `Arc`s; a refresh swaps the slot, it never edits in place.

use crate::compression::Encoding;
use crate::storage::ObjectMetadata;
use bytes::Bytes;
use log::debug;
use lru::LruCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub variant: Encoding,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, variant: Encoding) -> Self {
        Self { key: key.into(), variant }
    }
}

/// A fully prepared (rewritten, compressed) response body.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    /// Encoding actually applied to `body`; may be identity even when the
    /// key's variant is not, e.g. for bodies under the compression threshold.
    pub encoding: Encoding,
    pub content_type: String,
    pub cache_control: String,
    pub etag: String,
    pub metadata: ObjectMetadata,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn weight(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.metadata.last_modified
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

#[derive(Debug)]
struct CacheInner {
    lru: LruCache<CacheKey, Arc<CacheEntry>>,
    bytes_in_use: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub stored: bool,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    capacity: u64,
}

impl ResponseCache {
    /// `capacity` is the maximum total body weight in bytes. Zero disables
    /// storing entirely.
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns the live entry for `key`, promoting it to most recently used.
    /// Expired entries are dropped and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        let mut inner = self.lock();

        let entry = inner.lru.get(key)?.clone();
        if entry.is_expired(now) {
            if let Some(stale) = inner.lru.pop(key) {
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(stale.weight());
            }
            debug!("cache entry expired: {} ({})", key.key, key.variant);
            return None;
        }
        Some(entry)
    }

    /// Publishes `entry` under `key`, replacing any previous entry and evicting
    /// least recently used entries until the new one fits.
    pub fn insert(&self, key: CacheKey, entry: Arc<CacheEntry>) -> InsertOutcome {
        let weight = entry.weight();
        if weight > self.capacity || entry.ttl.is_zero() {
            return InsertOutcome::default();
        }

        let mut inner = self.lock();
        if let Some(previous) = inner.lru.pop(&key) {
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(previous.weight());
        }

        let mut evicted = 0;
        while inner.bytes_in_use + weight > self.capacity {
            match inner.lru.pop_lru() {
                Some((old_key, old)) => {
                    inner.bytes_in_use = inner.bytes_in_use.saturating_sub(old.weight());
                    evicted += 1;
                    debug!("cache evicted: {} ({}, {} bytes)", old_key.key, old_key.variant, old.weight());
                }
                None => break,
            }
        }

        inner.bytes_in_use += weight;
        inner.lru.push(key, entry);
        InsertOutcome { stored: true, evicted }
    }

    /// Removes every variant stored for `object_key`. Returns how many
    /// entries were dropped.
    pub fn invalidate(&self, object_key: &str) -> usize {
        let mut inner = self.lock();
        let keys: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|(k, _)| k.key == object_key)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(old) = inner.lru.pop(key) {
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(old.weight());
            }
        }
        keys.len()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(old) = inner.lru.pop(key) {
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(old.weight());
            }
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.bytes_in_use = 0;
    }

    /// Current total weight in bytes.
    pub fn weight(&self) -> u64 {
        self.lock().bytes_in_use
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().lru.contains(key)
    }
}
