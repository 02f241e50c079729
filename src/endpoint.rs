//! Service endpoint model: per-service host tiers, regions and the
//! discovery wire shapes they are decoded from

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend services a region publishes hosts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    /// Upload service
    Up,
    /// Download service
    Io,
    /// Resource management
    Rs,
    /// Listing
    Rsf,
    /// Generic API
    Api,
    /// Bucket management (also the discovery service)
    Uc,
    /// Source fetch
    IoSrc,
}

impl ServiceName {
    /// All services, in wire order
    pub const ALL: [ServiceName; 7] = [
        ServiceName::Up,
        ServiceName::Io,
        ServiceName::Rs,
        ServiceName::Rsf,
        ServiceName::Api,
        ServiceName::Uc,
        ServiceName::IoSrc,
    ];

    /// Name used by the discovery service
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Up => "up",
            ServiceName::Io => "io",
            ServiceName::Rs => "rs",
            ServiceName::Rsf => "rsf",
            ServiceName::Api => "api",
            ServiceName::Uc => "uc",
            ServiceName::IoSrc => "io_src",
        }
    }

    /// Parse a wire service name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two ordered host tiers: preferred hosts are tried before alternative ones
///
/// A host may be a bare domain, `domain:port`, or carry its own scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub alternative: Vec<String>,
}

impl Endpoints {
    /// Create endpoints from both tiers
    pub fn new(preferred: Vec<String>, alternative: Vec<String>) -> Self {
        Endpoints {
            preferred,
            alternative,
        }
    }

    /// Endpoints with only a preferred tier
    pub fn preferred_only<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Endpoints {
            preferred: hosts.into_iter().map(Into::into).collect(),
            alternative: Vec::new(),
        }
    }

    /// True when neither tier has a host
    pub fn is_empty(&self) -> bool {
        self.preferred.is_empty() && self.alternative.is_empty()
    }

    /// Total number of hosts across both tiers
    pub fn len(&self) -> usize {
        self.preferred.len() + self.alternative.len()
    }

    /// Hosts in attempt order: preferred tier, then alternative tier
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.preferred
            .iter()
            .chain(self.alternative.iter())
            .map(String::as_str)
    }

    /// Fully qualified base URLs in attempt order
    pub fn urls(&self, use_https: bool) -> Vec<String> {
        self.hosts().map(|h| host_to_url(h, use_https)).collect()
    }

    /// First usable base URL, for one-off calls before a selector is involved
    pub fn first_url(&self, use_https: bool) -> Option<String> {
        self.hosts().next().map(|h| host_to_url(h, use_https))
    }

    /// Stable fingerprint of both tiers: each tier sorted and comma-joined
    pub fn fingerprint(&self) -> u64 {
        let mut preferred = self.preferred.clone();
        preferred.sort();
        let mut alternative = self.alternative.clone();
        alternative.sort();
        let joined = format!("{};{}", preferred.join(","), alternative.join(","));
        xxhash_rust::xxh3::xxh3_64(joined.as_bytes())
    }
}

/// Prefix a host with a scheme unless it already carries one
pub fn host_to_url(host: &str, use_https: bool) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else if use_https {
        format!("https://{}", host)
    } else {
        format!("http://{}", host)
    }
}

/// Strip scheme and trailing slash from a host or URL
pub fn host_key(host: &str) -> &str {
    let host = host.trim_end_matches('/');
    match host.find("://") {
        Some(idx) => &host[idx + 3..],
        None => host,
    }
}

/// A region: its identifier plus one set of endpoints per service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    #[serde(default)]
    pub up: Endpoints,
    #[serde(default)]
    pub io: Endpoints,
    #[serde(default)]
    pub rs: Endpoints,
    #[serde(default)]
    pub rsf: Endpoints,
    #[serde(default)]
    pub api: Endpoints,
    #[serde(default)]
    pub uc: Endpoints,
    #[serde(default)]
    pub io_src: Endpoints,
}

impl Region {
    /// Create an empty region
    pub fn new(id: impl Into<String>) -> Self {
        Region {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Endpoints for one service
    pub fn endpoints(&self, service: ServiceName) -> &Endpoints {
        match service {
            ServiceName::Up => &self.up,
            ServiceName::Io => &self.io,
            ServiceName::Rs => &self.rs,
            ServiceName::Rsf => &self.rsf,
            ServiceName::Api => &self.api,
            ServiceName::Uc => &self.uc,
            ServiceName::IoSrc => &self.io_src,
        }
    }

    fn endpoints_mut(&mut self, service: ServiceName) -> &mut Endpoints {
        match service {
            ServiceName::Up => &mut self.up,
            ServiceName::Io => &mut self.io,
            ServiceName::Rs => &mut self.rs,
            ServiceName::Rsf => &mut self.rsf,
            ServiceName::Api => &mut self.api,
            ServiceName::Uc => &mut self.uc,
            ServiceName::IoSrc => &mut self.io_src,
        }
    }

    /// Builder-style setter for one service
    pub fn with_service(mut self, service: ServiceName, endpoints: Endpoints) -> Self {
        *self.endpoints_mut(service) = endpoints;
        self
    }
}

/// Per-service domain lists as sent by the discovery service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDomains {
    /// Current domains (preferred tier)
    #[serde(default)]
    pub domains: Vec<String>,
    /// Legacy domains (alternative tier)
    #[serde(default)]
    pub old: Vec<String>,
}

impl From<ServiceDomains> for Endpoints {
    fn from(d: ServiceDomains) -> Self {
        Endpoints::new(d.domains, d.old)
    }
}

/// One region as described by the discovery service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegionDescriptor {
    #[serde(default, alias = "id")]
    pub region: String,
    /// Freshness in seconds
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub up: ServiceDomains,
    #[serde(default)]
    pub io: ServiceDomains,
    #[serde(default)]
    pub rs: ServiceDomains,
    #[serde(default)]
    pub rsf: ServiceDomains,
    #[serde(default)]
    pub api: ServiceDomains,
    #[serde(default)]
    pub uc: ServiceDomains,
    #[serde(default)]
    pub io_src: ServiceDomains,
}

impl From<RegionDescriptor> for Region {
    fn from(d: RegionDescriptor) -> Self {
        Region {
            id: d.region,
            up: d.up.into(),
            io: d.io.into(),
            rs: d.rs.into(),
            rsf: d.rsf.into(),
            api: d.api.into(),
            uc: d.uc.into(),
            io_src: d.io_src.into(),
        }
    }
}

/// Discovery response body; the list is named `hosts` by the bucket query
/// and `regions` by the account query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegionsResponse {
    #[serde(default, alias = "regions")]
    pub hosts: Vec<RegionDescriptor>,
}

impl RegionsResponse {
    /// Smallest TTL across the returned regions, in seconds
    pub fn min_ttl(&self) -> Option<u64> {
        self.hosts.iter().map(|r| r.ttl).min()
    }

    /// Convert into regions, preserving server order
    pub fn into_regions(self) -> Vec<Region> {
        self.hosts.into_iter().map(Region::from).collect()
    }
}
