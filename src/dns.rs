//! Address resolution for the intra-host retry layer
//!
//! The host selector asks a [`HostResolver`] for the addresses behind one host
//! and an [`IpChooser`] for the order to try them in.

use crate::error::{ResolveError, Result};
use crate::ttl_cache::{CacheEntry, TtlCache};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default freshness of cached resolutions
pub const DEFAULT_DNS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves a host name to IP addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Orders resolved addresses for attempts
pub trait IpChooser: Send + Sync {
    fn choose(&self, host: &str, ips: Vec<IpAddr>) -> Vec<IpAddr>;
}

/// Split `host[:port]`, including bracketed IPv6 literals
pub fn split_host_port(host: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (addr, port);
        }
    }
    match host.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        _ => (host, None),
    }
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let (name, _) = split_host_port(crate::endpoint::host_key(host));
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| ResolveError::Transport(format!("Failed to resolve {}: {}", name, e)))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }

        if ips.is_empty() {
            return Err(ResolveError::Transport(format!("No addresses found for {}", name)));
        }
        debug!("Resolved {} to {:?}", name, ips);
        Ok(ips)
    }
}

/// Resolver that memoizes another resolver in a TTL cache
///
/// Keys include the local outbound address, so a machine moving between
/// networks does not reuse answers from the previous one.
pub struct CachedResolver {
    inner: Arc<dyn HostResolver>,
    cache: Arc<TtlCache<Vec<IpAddr>>>,
    ttl: Duration,
    local_ip: String,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn HostResolver>, cache: Arc<TtlCache<Vec<IpAddr>>>, ttl: Duration) -> Self {
        let local_ip = local_outbound_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        CachedResolver {
            inner,
            cache,
            ttl,
            local_ip,
        }
    }

    /// Cache key for `host`
    pub fn cache_key(&self, host: &str) -> String {
        format!("{}|{}", self.local_ip, host)
    }
}

#[async_trait]
impl HostResolver for CachedResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let key = self.cache_key(host);
        let inner = self.inner.clone();
        let ttl = self.ttl;
        self.cache
            .get(&key, || async move {
                let ips = inner.resolve(host).await?;
                Ok(CacheEntry::without_refresh(ips, ttl))
            })
            .await
            .into_result()
    }
}

/// Address the OS would use to reach the internet; no packet is sent
fn local_outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Keeps resolver order
#[derive(Debug, Clone, Default)]
pub struct InOrderChooser;

impl IpChooser for InOrderChooser {
    fn choose(&self, _host: &str, ips: Vec<IpAddr>) -> Vec<IpAddr> {
        ips
    }
}

/// Shuffles addresses to spread load across them
#[derive(Debug, Clone, Default)]
pub struct ShuffleChooser;

impl IpChooser for ShuffleChooser {
    fn choose(&self, _host: &str, mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
        ips.shuffle(&mut rand::thread_rng());
        ips
    }
}
