//! Configuration management for endpoint resolution

use crate::endpoint::{Endpoints, Region};
use crate::error::{ResolveError, Result};
use crate::host_selector::{RetryPolicy, SelectorOptions};
use crate::ttl_cache::CacheOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the resolvers and selectors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolverConfig {
    /// Discovery hosts, tried first
    #[serde(default)]
    pub discovery_hosts: Vec<String>,

    /// Discovery hosts tried after `discovery_hosts` are exhausted
    #[serde(default)]
    pub backup_discovery_hosts: Vec<String>,

    /// Whether bare hosts are reached over https (default: true)
    #[serde(default = "default_true")]
    pub use_https: bool,

    /// Fixed regions; when set no discovery query is ever sent
    #[serde(default)]
    pub static_regions: Vec<Region>,

    /// Timeout for one discovery request in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a failed host is skipped, in seconds (default: 600)
    #[serde(default = "default_host_freeze")]
    pub host_freeze_secs: u64,

    /// Hosts tried per call (default: every candidate)
    #[serde(default)]
    pub retry_max: Option<usize>,

    /// Attempts on one host before moving on (default: 1)
    #[serde(default = "default_per_host_retries")]
    pub per_host_retries: usize,

    /// Resolve hosts to addresses for the intra-host retry layer
    #[serde(default)]
    pub resolve_ips: bool,

    /// Cache persistence
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Persistence settings shared by every cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether caches are written to disk (default: true)
    #[serde(default = "default_true")]
    pub enable_persistence: bool,

    /// Directory holding the cache files (default: <temp>/endpoint-resolver)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Seconds between flushes of buffered writes (default: 60)
    #[serde(default = "default_interval")]
    pub persist_interval_secs: u64,

    /// Seconds between compactions (default: 60)
    #[serde(default = "default_interval")]
    pub compact_interval_secs: u64,

    /// Freshness of cached DNS answers in seconds (default: 300)
    #[serde(default = "default_dns_cache_ttl")]
    pub dns_cache_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enable_persistence: default_true(),
            cache_dir: default_cache_dir(),
            persist_interval_secs: default_interval(),
            compact_interval_secs: default_interval(),
            dns_cache_ttl_secs: default_dns_cache_ttl(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_host_freeze() -> u64 {
    600
}

fn default_per_host_retries() -> usize {
    1
}

fn default_cache_dir() -> String {
    std::env::temp_dir()
        .join("endpoint-resolver")
        .to_string_lossy()
        .into_owned()
}

fn default_interval() -> u64 {
    60
}

fn default_dns_cache_ttl() -> u64 {
    300
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            discovery_hosts: Vec::new(),
            backup_discovery_hosts: Vec::new(),
            use_https: default_true(),
            static_regions: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            host_freeze_secs: default_host_freeze(),
            retry_max: None,
            per_host_retries: default_per_host_retries(),
            resolve_ips: false,
            cache: CacheConfig::default(),
        }
    }
}

impl ResolverConfig {
    /// Configuration querying the given discovery hosts
    pub fn with_discovery_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResolverConfig {
            discovery_hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ResolverConfig)` if loading and validation succeed
    /// * `Err(ResolveError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ResolveError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ResolverConfig = serde_yaml::from_str(content).map_err(|e| {
            ResolveError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - discovery hosts or static regions must be configured
    /// - request timeout, freeze duration and per-host retries must be > 0
    /// - retry_max, when set, must be > 0
    /// - persistence intervals must be > 0 when persistence is enabled
    pub fn validate(&self) -> Result<()> {
        if self.discovery_hosts.is_empty()
            && self.backup_discovery_hosts.is_empty()
            && self.static_regions.is_empty()
        {
            return Err(ResolveError::ConfigError(
                "no endpoints configured: set discovery_hosts or static_regions".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(ResolveError::ConfigError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.host_freeze_secs == 0 {
            return Err(ResolveError::ConfigError(
                "host_freeze_secs must be greater than 0".to_string(),
            ));
        }

        if self.per_host_retries == 0 {
            return Err(ResolveError::ConfigError(
                "per_host_retries must be greater than 0".to_string(),
            ));
        }

        if self.retry_max == Some(0) {
            return Err(ResolveError::ConfigError(
                "retry_max must be greater than 0 when set".to_string(),
            ));
        }

        if self.cache.enable_persistence {
            if self.cache.cache_dir.is_empty() {
                return Err(ResolveError::ConfigError(
                    "cache_dir must not be empty when persistence is enabled".to_string(),
                ));
            }
            if self.cache.persist_interval_secs == 0 || self.cache.compact_interval_secs == 0 {
                return Err(ResolveError::ConfigError(
                    "persist_interval_secs and compact_interval_secs must be greater than 0"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Discovery hosts as tiered endpoints
    pub fn discovery_endpoints(&self) -> Endpoints {
        Endpoints::new(
            self.discovery_hosts.clone(),
            self.backup_discovery_hosts.clone(),
        )
    }

    /// Options for host selectors built from this config
    pub fn selector_options(&self) -> SelectorOptions {
        SelectorOptions {
            use_https: self.use_https,
            host_freeze_duration: Duration::from_secs(self.host_freeze_secs),
            retry_max: self.retry_max,
            per_host_retry: RetryPolicy::new(self.per_host_retries),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Options for the cache `name`, persisted as `<cache_dir>/<file_name>`
    pub fn cache_options(&self, name: &str, file_name: &str) -> CacheOptions {
        let options = if self.cache.enable_persistence {
            CacheOptions::persistent(name, PathBuf::from(&self.cache.cache_dir).join(file_name))
        } else {
            CacheOptions::memory_only(name)
        };
        options.with_intervals(
            Duration::from_secs(self.cache.persist_interval_secs),
            Duration::from_secs(self.cache.compact_interval_secs),
        )
    }
}
