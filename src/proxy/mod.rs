//! Request routing: serve from the cache or forward to the origin.
//!
//! [`CachingProxy`] is the handler behind the server. For each request it
//! derives the cache key, serves a live and valid entry directly, and
//! otherwise forwards through the [`Transport`], capturing the response on
//! the way back.
//!
//! ```text
//! request ─▶ derive key ─▶ store.get ─┬─ valid hit ──────────────▶ X-Cache: HIT
//!                                     └─ miss / invalid ─▶ transport ─▶ capture ─▶ X-Cache: MISS
//!                                                             │            │
//!                                                             └──── error ─┴──▶ 502 / 504
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::cache::{CacheEntry, CacheStatus, CacheStore, ResponseCapture, X_CACHE, key_for};
use crate::http::{Method, Request, Response, StatusCode};
use crate::logging::{AccessLogEvent, log_access};
use crate::upstream::Transport;

/// What happened to a request, for the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cache(CacheStatus),
    GatewayError,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cache(status) => status.as_str(),
            Self::GatewayError => "ERROR",
        }
    }
}

/// Caching reverse proxy for one origin.
///
/// The store is shared by `Arc`; the transport is owned. Any number of
/// requests may be in flight at once.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rcache::cache::CacheStore;
/// use rcache::config::Origin;
/// use rcache::proxy::CachingProxy;
/// use rcache::upstream::HttpTransport;
///
/// let origin = Origin::parse("http://api.example.com").unwrap();
/// let transport = HttpTransport::new(origin.clone(), Duration::from_secs(10), Duration::from_secs(30));
/// let store = Arc::new(CacheStore::new());
/// let proxy = CachingProxy::new(store, transport, origin.authority(), Duration::from_secs(300));
/// ```
pub struct CachingProxy<T> {
    store: Arc<CacheStore>,
    capture: ResponseCapture,
    transport: T,
    origin_host: String,
}

impl<T: Transport> CachingProxy<T> {
    pub fn new(
        store: Arc<CacheStore>,
        transport: T,
        origin_host: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let origin_host = origin_host.into();
        Self {
            capture: ResponseCapture::new(Arc::clone(&store), origin_host.clone(), ttl),
            store,
            transport,
            origin_host,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Handles one inbound request end to end.
    pub async fn handle(&self, request: Request) -> Response {
        let start = Instant::now();
        let key = key_for(&request, &self.origin_host);

        let (response, outcome) = match self.lookup(&key) {
            Some(entry) => (serve_cached(&entry), Outcome::Cache(CacheStatus::Hit)),
            None => self.forward(&request).await,
        };
        let response = response.for_head(*request.method() == Method::Head);

        log_access(AccessLogEvent {
            method: request.method().as_str(),
            uri: request.request_uri(),
            status: response.status().as_u16(),
            cache: outcome.as_str(),
            bytes_out: response.body_data().len(),
            elapsed: start.elapsed(),
        });

        response
    }

    // A stored entry that fails the sanity check is never served.
    fn lookup(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.store.get(key)?;
        if !entry.is_valid() {
            warn!(
                key = %key,
                status = entry.status_code(),
                bytes = entry.body().len(),
                "invalid cache entry: forwarding upstream"
            );
            return None;
        }
        Some(entry)
    }

    async fn forward(&self, request: &Request) -> (Response, Outcome) {
        let upstream = match self.transport.round_trip(request).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(uri = %request.request_uri(), error = %e, "origin request failed");
                let status = if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                return (gateway_error(status), Outcome::GatewayError);
            }
        };

        match self.capture.capture(request, upstream).await {
            Ok(response) => (response, Outcome::Cache(CacheStatus::Miss)),
            Err(e) => {
                error!(uri = %request.request_uri(), error = %e, "response capture failed");
                (gateway_error(StatusCode::BAD_GATEWAY), Outcome::GatewayError)
            }
        }
    }
}

/// Builds the client response for a cache hit: the stored headers and body,
/// the stored status, and `X-Cache: HIT`.
///
/// The caller must have checked [`CacheEntry::is_valid`].
pub fn serve_cached(entry: &CacheEntry) -> Response {
    let status = StatusCode::from_u16(entry.status_code()).unwrap_or(StatusCode::OK);
    let mut response = Response::new(status)
        .with_headers(entry.headers().clone())
        .body_bytes(entry.body().clone());
    response.set_header(X_CACHE, CacheStatus::Hit.as_str());
    response
}

fn gateway_error(status: StatusCode) -> Response {
    Response::new(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(status.canonical_reason())
        .keep_alive(false)
}
