use std::time::Instant;

use bytes::Bytes;

use crate::http::{Headers, StatusCode};

/// One captured upstream response.
///
/// Entries are immutable once built. The header set is owned by the entry and
/// never shared with a live response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    body: Bytes,
    headers: Headers,
    status_code: u16,
    expires_at: Instant,
}

impl CacheEntry {
    /// Builds an entry that stops being served at `expires_at`.
    pub fn new(status_code: u16, headers: Headers, body: impl Into<Bytes>, expires_at: Instant) -> Self {
        Self {
            body: body.into(),
            headers,
            status_code,
            expires_at,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns `true` once `now` has reached the expiry instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Sanity check applied before serving.
    ///
    /// A zero (or otherwise out-of-range) status, or an empty body, marks an
    /// entry that must never be served.
    pub fn is_valid(&self) -> bool {
        self.status_code != 0
            && StatusCode::from_u16(self.status_code).is_some()
            && !self.body.is_empty()
    }
}
