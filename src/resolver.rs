use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::error::Error;

/// Default DNS request timeout.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Public resolvers queried over TCP/53 when the system is not trusted to
/// resolve for us.
pub const DEFAULT_NAMESERVERS: [&str; 8] = [
    "119.29.29.29",
    "119.28.28.28",
    "223.5.5.5",
    "223.6.6.6",
    "1.0.0.1",
    "1.1.1.1",
    "8.8.8.8",
    "8.8.4.4",
];

/// Name resolution capability. Injected wherever an address must be dialed
/// so tests can substitute a fixed table.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>, Error>;

    /// Resolve to a single address: literal IPs pass through, lookups return
    /// a uniformly random pick from the answer set.
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let ips = self.lookup_ip(host).await?;
        pick(host, &ips)
    }

    async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(_) => Ok(ip),
                IpAddr::V6(_) => Err(Error::IpVersion(host.to_string())),
            };
        }
        let ips = self.lookup_ipv4(host).await?;
        pick(host, &ips)
    }

    async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V6(_) => Ok(ip),
                IpAddr::V4(_) => Err(Error::IpVersion(host.to_string())),
            };
        }
        let ips = self.lookup_ipv6(host).await?;
        pick(host, &ips)
    }
}

fn pick(host: &str, ips: &[IpAddr]) -> Result<IpAddr, Error> {
    ips.choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| Error::ResolveFailed(host.to_string()))
}

/// Resolver backed by the fixed public nameserver set.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> Self {
        let mut config = ResolverConfig::new();
        for ns in DEFAULT_NAMESERVERS {
            let addr = SocketAddr::new(ns.parse().expect("static nameserver literal"), 53);
            config.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));
        }
        let mut opts = ResolverOpts::default();
        opts.timeout = DEFAULT_DNS_TIMEOUT;
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }

    pub fn nameservers(&self) -> Vec<String> {
        DEFAULT_NAMESERVERS.iter().map(|s| format!("{s}:53/tcp")).collect()
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let start = std::time::Instant::now();
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| {
                debug!(host, error = %e, "dns lookup failed");
                Error::ResolveFailed(host.to_string())
            })?;
        debug!(host, elapsed = ?start.elapsed(), "dns query");
        Ok(lookup.iter().collect())
    }

    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let lookup = self
            .inner
            .ipv4_lookup(host)
            .await
            .map_err(|_| Error::ResolveFailed(host.to_string()))?;
        Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect())
    }

    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let lookup = self
            .inner
            .ipv6_lookup(host)
            .await
            .map_err(|_| Error::ResolveFailed(host.to_string()))?;
        Ok(lookup.iter().map(|a| IpAddr::V6(a.0)).collect())
    }
}

/// Fixed-table resolver for tests and offline wiring.
#[derive(Default)]
pub struct StaticResolver {
    table: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, ip: IpAddr) -> Self {
        self.table.entry(host.to_string()).or_default().push(ip);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        self.table
            .get(host)
            .cloned()
            .ok_or_else(|| Error::ResolveFailed(host.to_string()))
    }

    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        Ok(self
            .lookup_ip(host)
            .await?
            .into_iter()
            .filter(|ip| ip.is_ipv4())
            .collect())
    }

    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        Ok(self
            .lookup_ip(host)
            .await?
            .into_iter()
            .filter(|ip| ip.is_ipv6())
            .collect())
    }
}
