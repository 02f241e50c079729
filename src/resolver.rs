//! Entry point tying configuration, caches, discovery and failover together
//!
//! [`EndpointResolver`] is what the rest of an SDK talks to: it answers
//! "which regions serve this bucket / account" and runs business requests
//! against a region's hosts with failover.

use crate::account_resolver::{AccountRegionResolver, ACCOUNT_CACHE_FILE, ACCOUNT_CACHE_NAME};
use crate::bucket_resolver::{BucketRegionResolver, BUCKET_CACHE_FILE, BUCKET_CACHE_NAME};
use crate::config::ResolverConfig;
use crate::discovery::{DiscoveryClient, RequestAuthorizer};
use crate::dns::{CachedResolver, ShuffleChooser, SystemResolver};
use crate::endpoint::{Endpoints, Region, ServiceName};
use crate::error::{ResolveError, Result};
use crate::host_selector::{AttemptTarget, HostSelector};
use crate::metrics::ResolverMetrics;
use crate::registry::CacheRegistry;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Name of the DNS cache in logs and metrics
pub const DNS_CACHE_NAME: &str = "resolver";

/// File the DNS cache persists to
pub const DNS_CACHE_FILE: &str = "resolver.json";

/// Where regions come from
enum RegionSource {
    /// Fixed regions from configuration
    Static(Vec<Region>),
    /// Discovery service, cached
    Discovery {
        bucket: BucketRegionResolver,
        account: AccountRegionResolver,
    },
}

/// Region resolution and host failover for one configuration
pub struct EndpointResolver {
    source: RegionSource,
    selector: Arc<HostSelector>,
    metrics: ResolverMetrics,
}

impl EndpointResolver {
    /// Build a resolver with its own metrics and unsigned discovery requests
    pub fn new(config: &ResolverConfig, registry: &CacheRegistry) -> Result<Self> {
        let metrics = ResolverMetrics::new()
            .map_err(|e| ResolveError::ConfigError(format!("Failed to create metrics: {}", e)))?;
        Self::new_with(config, registry, metrics, None)
    }

    /// Build a resolver recording into `metrics` and optionally signing
    /// discovery requests with `authorizer`
    pub fn new_with(
        config: &ResolverConfig,
        registry: &CacheRegistry,
        metrics: ResolverMetrics,
        authorizer: Option<Arc<dyn RequestAuthorizer>>,
    ) -> Result<Self> {
        config.validate()?;

        let source = if !config.static_regions.is_empty() {
            info!(
                "Using {} static regions, discovery disabled",
                config.static_regions.len()
            );
            RegionSource::Static(config.static_regions.clone())
        } else {
            let discovery_selector = Arc::new(
                HostSelector::new(config.selector_options()).with_observer(Arc::new(metrics.clone())),
            );
            let mut discovery = DiscoveryClient::new(
                config.discovery_endpoints(),
                discovery_selector,
                config.request_timeout(),
            )?;
            if let Some(authorizer) = authorizer {
                discovery = discovery.with_authorizer(authorizer);
            }
            let discovery = Arc::new(discovery);

            let bucket_cache =
                registry.get_or_create(config.cache_options(BUCKET_CACHE_NAME, BUCKET_CACHE_FILE))?;
            let account_cache =
                registry.get_or_create(config.cache_options(ACCOUNT_CACHE_NAME, ACCOUNT_CACHE_FILE))?;

            info!(
                "Using discovery hosts {:?}",
                config.discovery_endpoints().urls(config.use_https)
            );
            RegionSource::Discovery {
                bucket: BucketRegionResolver::new(discovery.clone(), bucket_cache)
                    .with_metrics(metrics.clone()),
                account: AccountRegionResolver::new(discovery, account_cache)
                    .with_metrics(metrics.clone()),
            }
        };

        let mut selector =
            HostSelector::new(config.selector_options()).with_observer(Arc::new(metrics.clone()));
        if config.resolve_ips {
            let dns_cache =
                registry.get_or_create::<Vec<IpAddr>>(config.cache_options(DNS_CACHE_NAME, DNS_CACHE_FILE))?;
            let resolver = CachedResolver::new(
                Arc::new(SystemResolver),
                dns_cache,
                Duration::from_secs(config.cache.dns_cache_ttl_secs),
            );
            selector = selector.with_resolver(Arc::new(resolver), Arc::new(ShuffleChooser));
        }

        Ok(EndpointResolver {
            source,
            selector: Arc::new(selector),
            metrics,
        })
    }

    /// Regions serving `bucket` for the account behind `access_key`
    pub async fn resolve_bucket_regions(&self, access_key: &str, bucket: &str) -> Result<Vec<Region>> {
        match &self.source {
            RegionSource::Static(regions) => Ok(regions.clone()),
            RegionSource::Discovery { bucket: resolver, .. } => resolver.resolve(access_key, bucket).await,
        }
    }

    /// Every region visible to the account behind `access_key`
    pub async fn resolve_all_regions(&self, access_key: &str) -> Result<Vec<Region>> {
        match &self.source {
            RegionSource::Static(regions) => Ok(regions.clone()),
            RegionSource::Discovery { account, .. } => account.resolve_all(access_key).await,
        }
    }

    /// Run a business request against `endpoints` with failover
    pub async fn select_and_do<T, F, Fut>(&self, endpoints: &Endpoints, attempt: F) -> Result<T>
    where
        F: FnMut(AttemptTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.selector.select_and_do(endpoints, attempt).await
    }

    /// Resolve `bucket` and run a request against its `service` hosts
    ///
    /// The first region (in discovery order) publishing hosts for `service`
    /// is used.
    ///
    /// # Returns
    /// * `Ok(T)` from the first successful attempt
    /// * `Err(ResolveError::NoRegion)` if no region serves `service`
    /// * `Err(e)` from resolution or the last attempt otherwise
    pub async fn bucket_service_do<T, F, Fut>(
        &self,
        access_key: &str,
        bucket: &str,
        service: ServiceName,
        attempt: F,
    ) -> Result<T>
    where
        F: FnMut(AttemptTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let regions = self.resolve_bucket_regions(access_key, bucket).await?;
        let region = regions
            .iter()
            .find(|r| !r.endpoints(service).is_empty())
            .ok_or_else(|| {
                ResolveError::NoRegion(format!(
                    "no region of bucket {} publishes {} hosts",
                    bucket, service
                ))
            })?;

        debug!("Using region {} for {} on bucket {}", region.id, service, bucket);
        self.selector
            .select_and_do(region.endpoints(service), attempt)
            .await
    }

    /// Forget cached regions of one bucket; `false` if none were cached
    pub fn invalidate_bucket(&self, access_key: &str, bucket: &str) -> bool {
        match &self.source {
            RegionSource::Static(_) => false,
            RegionSource::Discovery { bucket: resolver, .. } => resolver.invalidate(access_key, bucket),
        }
    }

    /// Write buffered cache entries to disk
    pub async fn flush(&self) {
        if let RegionSource::Discovery { bucket, account } = &self.source {
            bucket.cache().flush().await;
            account.cache().flush().await;
        }
    }

    /// Whether regions come from configuration rather than discovery
    pub fn is_static(&self) -> bool {
        matches!(self.source, RegionSource::Static(_))
    }

    /// Selector used for business requests
    pub fn selector(&self) -> &HostSelector {
        &self.selector
    }

    pub fn metrics(&self) -> &ResolverMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_config() -> ResolverConfig {
        let z0 = Region::new("z0").with_service(
            ServiceName::Up,
            Endpoints::new(vec!["up-z0.example.com".into()], vec!["up-z0-old.example.com".into()]),
        );
        let z1 = Region::new("z1").with_service(ServiceName::Io, Endpoints::preferred_only(["io-z1.example.com"]));
        let mut config = ResolverConfig {
            static_regions: vec![z0, z1],
            use_https: false,
            ..Default::default()
        };
        config.cache.enable_persistence = false;
        config
    }

    #[tokio::test]
    async fn test_static_regions_skip_discovery() {
        let registry = CacheRegistry::new();
        let resolver = EndpointResolver::new(&static_config(), &registry).unwrap();
        assert!(resolver.is_static());
        assert!(registry.is_empty());

        let regions = resolver.resolve_bucket_regions("AK1", "b").await.unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(resolver.resolve_all_regions("AK1").await.unwrap(), regions);
        assert!(!resolver.invalidate_bucket("AK1", "b"));
    }

    #[tokio::test]
    async fn test_bucket_service_do_picks_serving_region() {
        let registry = CacheRegistry::new();
        let resolver = EndpointResolver::new(&static_config(), &registry).unwrap();

        let url = resolver
            .bucket_service_do("AK1", "b", ServiceName::Io, |target| async move { Ok(target.url) })
            .await
            .unwrap();
        assert_eq!(url, "http://io-z1.example.com");

        let result: Result<()> = resolver
            .bucket_service_do("AK1", "b", ServiceName::Rsf, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ResolveError::NoRegion(_))));
    }

    #[tokio::test]
    async fn test_business_failover_freezes_host() {
        let registry = CacheRegistry::new();
        let resolver = EndpointResolver::new(&static_config(), &registry).unwrap();

        let host = resolver
            .bucket_service_do("AK1", "b", ServiceName::Up, |target| async move {
                if target.host == "up-z0.example.com" {
                    Err(ResolveError::from_http_status(503, "unavailable"))
                } else {
                    Ok(target.host)
                }
            })
            .await
            .unwrap();
        assert_eq!(host, "up-z0-old.example.com");
        assert!(resolver.selector().is_frozen("up-z0.example.com"));
        assert_eq!(resolver.metrics().host_freezes_total.get(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = CacheRegistry::new();
        let result = EndpointResolver::new(&ResolverConfig::default(), &registry);
        assert!(matches!(result, Err(ResolveError::ConfigError(_))));
    }
}
