//! Response cache: key derivation, a TTL-masked in-memory store, and the
//! capture step that fills it from upstream responses.
//!
//! ## Core types
//!
//! - [`derive_key`]: maps method, origin host and request URI to a cache key.
//! - [`CacheEntry`]: one captured response plus its expiry instant.
//! - [`CacheStore`]: the shared key → entry map, guarded by a readers-writer lock.
//! - [`ResponseCapture`]: drains an upstream body, stores the entry, and tags
//!   the outgoing response `X-Cache: MISS`.
//!
//! Entries are never evicted. An expired entry stays in the map, masked on
//! lookup, until a fresh capture under the same key overwrites it.

use std::fmt;
use std::time::Duration;

mod capture;
mod entry;
mod key;
mod store;

pub use capture::{CaptureError, ResponseCapture};
pub use entry::CacheEntry;
pub use key::{derive_key, key_for};
pub use store::{CacheStats, CacheStore};

/// Response header that tells the client whether the cache answered.
pub const X_CACHE: &str = "X-Cache";

/// Default lifetime of a captured response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Outcome tag written into the [`X_CACHE`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store; the origin was not contacted.
    Hit,
    /// Fetched from the origin and captured.
    Miss,
}

impl CacheStatus {
    /// Returns the header value for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
