//! # rcache
//!
//! A caching HTTP/1.1 reverse proxy for a single origin.
//!
//! Every inbound request is keyed by method, origin host and request URI.
//! A live cached response is replayed with `X-Cache: HIT`; anything else is
//! forwarded to the origin, captured into the cache and relayed with
//! `X-Cache: MISS`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rcache::config::ProxyConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new(3000, "http://dummyjson.com")?
//!         .with_cache_ttl(Duration::from_secs(60));
//!     config.validate()?;
//!     rcache::run(config).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::info;

pub mod cache;
pub mod cli;
pub mod config;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod upstream;

pub use cache::{CacheEntry, CacheStore, ResponseCapture};
pub use config::{Origin, ProxyConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::CachingProxy;
pub use server::{Server, ServerError};
pub use upstream::{HttpTransport, Transport};

/// Serves `proxy` on an already bound `server` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Io`] if the listener fails.
pub async fn serve<T, S>(
    server: Server,
    proxy: Arc<CachingProxy<T>>,
    shutdown: S,
) -> Result<(), ServerError>
where
    T: Transport + 'static,
    S: Future<Output = ()>,
{
    server
        .run_until(
            move |request: Request| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle(request).await }
            },
            shutdown,
        )
        .await
}

/// Runs the proxy described by `config` until Ctrl-C.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the listen address is unavailable.
pub async fn run(config: ProxyConfig) -> Result<(), ServerError> {
    run_until(config, async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler available; run until the process is killed.
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Runs the proxy described by `config` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the listen address is unavailable.
pub async fn run_until<S>(config: ProxyConfig, shutdown: S) -> Result<(), ServerError>
where
    S: Future<Output = ()>,
{
    let store = Arc::new(CacheStore::new());
    if config.clear_cache() {
        let dropped = store.clear();
        info!(entries = dropped, "cache cleared");
    }

    let origin = config.origin().clone();
    let transport = HttpTransport::new(
        origin.clone(),
        config.connect_timeout(),
        config.upstream_timeout(),
    );
    let proxy = Arc::new(CachingProxy::new(
        store,
        transport,
        origin.authority(),
        config.cache_ttl(),
    ));

    let server = Server::bind(config.listen_addr().to_string()).await?;
    info!(
        origin = %origin,
        ttl_secs = config.cache_ttl().as_secs(),
        address = %server.local_addr(),
        "caching proxy ready"
    );
    serve(server, proxy, shutdown).await
}
