//! Command-line flags and their mapping onto [`crate::config::ProxyConfig`].

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::Parser;

use crate::config::{ConfigError, ProxyConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "rcache", version, about = "Caching HTTP/1.1 reverse proxy")]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, env = "RCACHE_PORT")]
    pub port: u16,

    /// Origin base URL that uncached requests are forwarded to.
    #[arg(long, env = "RCACHE_ORIGIN")]
    pub origin: String,

    /// Address to listen on.
    #[arg(long, env = "RCACHE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Lifetime of a cached response, in seconds.
    #[arg(long = "cache-ttl", env = "RCACHE_CACHE_TTL", default_value_t = 300)]
    pub cache_ttl: u64,

    /// Upstream connect timeout, in seconds.
    #[arg(long = "connect-timeout", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Upstream read/write timeout, in seconds.
    #[arg(long = "upstream-timeout", default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Empty the cache before serving.
    #[arg(long = "clear-cache")]
    pub clear_cache: bool,

    #[arg(long = "log-format", env = "RCACHE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Builds and validates the proxy configuration these flags describe.
    pub fn to_config(&self) -> Result<ProxyConfig, ConfigError> {
        let config = ProxyConfig::new(self.port, &self.origin)?
            .with_bind(self.bind)
            .with_cache_ttl(Duration::from_secs(self.cache_ttl))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_upstream_timeout(Duration::from_secs(self.upstream_timeout))
            .with_clear_cache(self.clear_cache);
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}
