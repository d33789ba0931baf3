//! Shared in-memory cache map with lazy expiration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use super::CacheEntry;

/// The process-wide response cache.
///
/// Constructed once at startup and shared by `Arc` with the request path and
/// the capture step. All reads take the read lock and all writes take the
/// write lock; no I/O ever happens while either is held.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use rcache::cache::{CacheEntry, CacheStore};
/// use rcache::http::Headers;
///
/// let store = CacheStore::new();
/// let now = Instant::now();
/// store.set("GET origin/", CacheEntry::new(200, Headers::new(), "hi", now + Duration::from_secs(300)));
///
/// assert!(store.get_at("GET origin/", now).is_some());
/// assert!(store.get_at("GET origin/", now + Duration::from_secs(300)).is_none());
/// ```
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

/// Point-in-time counts over the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry` under `key`, replacing whatever was there.
    pub fn set(&self, key: impl Into<String>, entry: CacheEntry) {
        let entry = Arc::new(entry);
        self.entries.write().insert(key.into(), entry);
    }

    /// Returns the live entry for `key`, or `None` if it is absent or expired.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.get_at(key, Instant::now())
    }

    /// [`get`](Self::get) evaluated at an explicit instant.
    ///
    /// Expired entries are masked, not removed.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Arc<CacheEntry>> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    /// Counts entries at `now`. Nothing is evicted.
    pub fn stats_at(&self, now: Instant) -> CacheStats {
        let entries = self.entries.read();
        let expired = entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .count();
        CacheStats {
            total_entries: entries.len(),
            expired_entries: expired,
            valid_entries: entries.len() - expired,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }
}
