use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::{CacheEntry, CacheStatus, CacheStore, X_CACHE, key_for};
use crate::http::{Request, Response};
use crate::upstream::{TransportError, UpstreamResponse};

/// The upstream body could not be buffered. Nothing was stored.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read upstream body: {0}")]
    Body(#[from] TransportError),
}

/// Turns an upstream response into a cache entry and the response relayed to
/// the client.
///
/// Runs once per upstream round trip, between the transport producing the
/// response head and the client receiving anything.
#[derive(Debug, Clone)]
pub struct ResponseCapture {
    store: Arc<CacheStore>,
    origin_host: String,
    ttl: Duration,
}

impl ResponseCapture {
    pub fn new(store: Arc<CacheStore>, origin_host: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            origin_host: origin_host.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Buffers `upstream`, stores it under the key of `request`, and returns
    /// the same status, headers and body tagged `X-Cache: MISS`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Body`] if the body cannot be read in full. The
    /// store is left untouched in that case.
    pub async fn capture(
        &self,
        request: &Request,
        upstream: UpstreamResponse,
    ) -> Result<Response, CaptureError> {
        let (status, headers, body) = upstream.into_parts();
        let body = body.collect().await?;

        let expires_at = Instant::now() + self.ttl;
        let key = key_for(request, &self.origin_host);
        debug!(key = %key, status = status.as_u16(), bytes = body.len(), "storing response");
        // The entry owns a copy of the headers; the relayed response keeps its own.
        self.store.set(
            key,
            CacheEntry::new(status.as_u16(), headers.clone(), body.clone(), expires_at),
        );

        let mut response = Response::new(status).with_headers(headers).body_bytes(body);
        response.set_header(X_CACHE, CacheStatus::Miss.as_str());
        Ok(response)
    }
}
