//! Runtime configuration: the origin to proxy for and the knobs around it.
//!
//! [`ProxyConfig`] is built and validated once at startup. Everything past
//! startup trusts it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::cache::DEFAULT_TTL;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upstream I/O timeout, applied to each read or write.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration errors, all reported before the proxy starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("listen port must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid origin URL: {0}")]
    InvalidOrigin(#[from] url::ParseError),

    #[error("unsupported origin scheme `{0}` (only http is supported)")]
    UnsupportedScheme(String),

    #[error("origin URL has no host")]
    MissingHost,

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
}

/// The upstream server uncached requests are forwarded to.
///
/// # Examples
///
/// ```
/// use rcache::config::Origin;
///
/// let origin = Origin::parse("http://api.example.com:8080/ignored").unwrap();
/// assert_eq!(origin.authority(), "api.example.com:8080");
/// assert_eq!(origin.socket_addr(), "api.example.com:8080");
///
/// // A bare host is taken to mean http.
/// let origin = Origin::parse("localhost:3000").unwrap();
/// assert_eq!(origin.authority(), "localhost:3000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    host: String,
    port: u16,
    authority: String,
}

impl Origin {
    /// Parses and validates an origin base URL.
    ///
    /// Only the host and port are kept; any path, query or credentials are
    /// ignored because requests are forwarded with their own path.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidOrigin`]: the string is not a URL.
    /// - [`ConfigError::UnsupportedScheme`]: the scheme is not `http`.
    /// - [`ConfigError::MissingHost`]: the URL names no host.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let url = if raw.contains("://") {
            Url::parse(raw)?
        } else {
            Url::parse(&format!("http://{raw}"))?
        };

        if url.scheme() != "http" {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::MissingHost)?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = match url.port() {
            Some(explicit) => format!("{host}:{explicit}"),
            None => host.clone(),
        };

        Ok(Self {
            host,
            port,
            authority,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host plus `:port` when the URL spelled out a non-default port. This is
    /// what goes into the upstream `Host` header and into cache keys.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// `host:port` suitable for opening a TCP connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// Validated proxy configuration.
///
/// Built with [`ProxyConfig::new`] and refined through the builder methods.
/// Call [`validate`](Self::validate) once all values are set.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rcache::config::ProxyConfig;
///
/// let config = ProxyConfig::new(8080, "http://api.example.com")
///     .unwrap()
///     .with_cache_ttl(Duration::from_secs(60));
/// config.validate().unwrap();
/// assert_eq!(config.listen_addr().port(), 8080);
/// ```
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    listen_addr: SocketAddr,
    origin: Origin,
    cache_ttl: Duration,
    connect_timeout: Duration,
    upstream_timeout: Duration,
    clear_cache: bool,
}

impl ProxyConfig {
    /// Creates a configuration listening on `0.0.0.0:port` for `origin`,
    /// with every other value at its default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPort`] for port `0`, or any error from
    /// [`Origin::parse`].
    pub fn new(port: u16, origin: &str) -> Result<Self, ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            origin: Origin::parse(origin)?,
            cache_ttl: DEFAULT_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            clear_cache: false,
        })
    }

    /// Listens on `ip` instead of all interfaces.
    #[must_use]
    pub fn with_bind(mut self, ip: IpAddr) -> Self {
        self.listen_addr.set_ip(ip);
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Requests that the cache be emptied before serving.
    #[must_use]
    pub fn with_clear_cache(mut self, clear: bool) -> Self {
        self.clear_cache = clear;
        self
    }

    /// Checks the values the builder methods cannot reject on their own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroDuration`] if the TTL or either timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cache TTL", self.cache_ttl),
            ("connect timeout", self.connect_timeout),
            ("upstream timeout", self.upstream_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    pub fn clear_cache(&self) -> bool {
        self.clear_cache
    }
}
