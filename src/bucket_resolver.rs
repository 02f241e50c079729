//! Resolves the regions serving one bucket
//!
//! Results are cached per (access key, bucket, discovery hosts), so two
//! buckets of one account never share an entry and changing the configured
//! discovery hosts starts from a clean key space.

use crate::discovery::{regions_entry, DiscoveryClient, QueryScope};
use crate::endpoint::Region;
use crate::error::{ResolveError, Result};
use crate::metrics::ResolverMetrics;
use crate::ttl_cache::{CacheStatus, TtlCache};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the bucket region cache in logs and metrics
pub const BUCKET_CACHE_NAME: &str = "bucket_regions";

/// File the bucket region cache persists to
pub const BUCKET_CACHE_FILE: &str = "regions_v4.json";

/// Bucket-scoped region resolver
pub struct BucketRegionResolver {
    discovery: Arc<DiscoveryClient>,
    cache: Arc<TtlCache<Vec<Region>>>,
    metrics: Option<ResolverMetrics>,
}

impl BucketRegionResolver {
    pub fn new(discovery: Arc<DiscoveryClient>, cache: Arc<TtlCache<Vec<Region>>>) -> Self {
        BucketRegionResolver {
            discovery,
            cache,
            metrics: None,
        }
    }

    /// Record lookups and queries in `metrics`
    pub fn with_metrics(mut self, metrics: ResolverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cache key for one bucket under the configured discovery hosts
    ///
    /// The access key is length-prefixed, so separators inside it cannot make
    /// two different pairs produce one key.
    pub fn cache_key(&self, access_key: &str, bucket: &str) -> String {
        format!(
            "{}:{}:{}:{:016x}",
            access_key.len(),
            access_key,
            bucket,
            self.discovery.hosts().fingerprint()
        )
    }

    /// Regions serving `bucket`, from cache or a discovery query
    ///
    /// # Returns
    /// * `Ok(Vec<Region>)` in the order the discovery service ranked them
    /// * `Err(ResolveError::ConfigError)` if the access key or bucket is empty
    /// * `Err(e)` if discovery failed and nothing valid is cached
    pub async fn resolve(&self, access_key: &str, bucket: &str) -> Result<Vec<Region>> {
        if access_key.is_empty() || bucket.is_empty() {
            return Err(ResolveError::ConfigError(
                "access key and bucket name must not be empty".to_string(),
            ));
        }

        let key = self.cache_key(access_key, bucket);
        let scope = QueryScope::Bucket {
            access_key: access_key.to_string(),
            bucket: bucket.to_string(),
        };

        let discovery = &self.discovery;
        let metrics = self.metrics.as_ref();
        let scope = &scope;
        let lookup = self
            .cache
            .get(&key, || async move {
                let result = discovery.query(scope).await;
                if let Some(metrics) = metrics {
                    metrics.record_discovery(scope.label(), result.is_ok());
                }
                regions_entry(result?)
            })
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(self.cache.name(), lookup.status);
        }

        match lookup.status {
            CacheStatus::Fresh => info!("Resolved regions for bucket {} via discovery", bucket),
            CacheStatus::Cached => debug!("Resolved regions for bucket {} from cache", bucket),
            CacheStatus::NoResult => {}
        }
        lookup.into_result()
    }

    /// Forget the cached regions of one bucket
    pub fn invalidate(&self, access_key: &str, bucket: &str) -> bool {
        self.cache.invalidate(&self.cache_key(access_key, bucket))
    }

    pub fn cache(&self) -> &Arc<TtlCache<Vec<Region>>> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoints;
    use crate::host_selector::{HostSelector, SelectorOptions};
    use std::time::Duration;

    fn resolver(hosts: Endpoints) -> BucketRegionResolver {
        let selector = Arc::new(HostSelector::new(SelectorOptions::default()));
        let discovery =
            Arc::new(DiscoveryClient::new(hosts, selector, Duration::from_secs(1)).unwrap());
        BucketRegionResolver::new(discovery, Arc::new(TtlCache::memory_only(BUCKET_CACHE_NAME)))
    }

    #[test]
    fn test_cache_key_isolation() {
        let resolver = resolver(Endpoints::preferred_only(["uc.example.com"]));
        let a = resolver.cache_key("AK1", "bucket-a");
        let b = resolver.cache_key("AK1", "bucket-b");
        let c = resolver.cache_key("AK2", "bucket-a");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("3:AK1:bucket-a:"));
    }

    #[test]
    fn test_cache_key_separators_do_not_collide() {
        let resolver = resolver(Endpoints::preferred_only(["uc.example.com"]));
        assert_ne!(resolver.cache_key("a:b", "c"), resolver.cache_key("a", "b:c"));
        assert_ne!(resolver.cache_key("a:1", "b"), resolver.cache_key("a", "1:b"));
    }

    #[test]
    fn test_cache_key_depends_on_discovery_hosts() {
        let one = resolver(Endpoints::preferred_only(["uc1.example.com", "uc2.example.com"]));
        let same = resolver(Endpoints::preferred_only(["uc2.example.com", "uc1.example.com"]));
        let other = resolver(Endpoints::preferred_only(["uc3.example.com"]));
        assert_eq!(one.cache_key("AK", "b"), same.cache_key("AK", "b"));
        assert_ne!(one.cache_key("AK", "b"), other.cache_key("AK", "b"));
    }

    #[tokio::test]
    async fn test_empty_arguments_are_rejected() {
        let resolver = resolver(Endpoints::preferred_only(["uc.example.com"]));
        assert!(matches!(
            resolver.resolve("", "bucket").await,
            Err(ResolveError::ConfigError(_))
        ));
        assert!(matches!(
            resolver.resolve("AK", "").await,
            Err(ResolveError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_regions_skip_discovery() {
        // Port 9 (discard) is never answered; a network call would fail
        let resolver = resolver(Endpoints::preferred_only(["http://127.0.0.1:9"]));
        let regions = vec![Region::new("z0")];
        resolver.cache().insert(
            &resolver.cache_key("AK1", "b"),
            crate::ttl_cache::CacheEntry::new(regions.clone(), Duration::from_secs(60)),
        );

        assert_eq!(resolver.resolve("AK1", "b").await.unwrap(), regions);
        assert!(resolver.invalidate("AK1", "b"));
        assert!(resolver.cache().is_empty());
    }
}
