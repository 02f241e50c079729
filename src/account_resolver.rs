//! Resolves every region visible to an account

use crate::discovery::{regions_entry, DiscoveryClient, QueryScope};
use crate::endpoint::Region;
use crate::error::{ResolveError, Result};
use crate::metrics::ResolverMetrics;
use crate::ttl_cache::TtlCache;
use std::sync::Arc;
use tracing::debug;

/// Name of the account region cache in logs and metrics
pub const ACCOUNT_CACHE_NAME: &str = "all_regions";

/// File the account region cache persists to
pub const ACCOUNT_CACHE_FILE: &str = "all_regions.json";

/// Account-wide region resolver
pub struct AccountRegionResolver {
    discovery: Arc<DiscoveryClient>,
    cache: Arc<TtlCache<Vec<Region>>>,
    metrics: Option<ResolverMetrics>,
}

impl AccountRegionResolver {
    pub fn new(discovery: Arc<DiscoveryClient>, cache: Arc<TtlCache<Vec<Region>>>) -> Self {
        AccountRegionResolver {
            discovery,
            cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResolverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cache key for one account; the access key is length-prefixed like the
    /// bucket resolver's keys
    pub fn cache_key(&self, access_key: &str) -> String {
        format!(
            "{}:{}:{:016x}",
            access_key.len(),
            access_key,
            self.discovery.hosts().fingerprint()
        )
    }

    /// All regions of the account behind `access_key`
    pub async fn resolve_all(&self, access_key: &str) -> Result<Vec<Region>> {
        if access_key.is_empty() {
            return Err(ResolveError::ConfigError(
                "access key must not be empty".to_string(),
            ));
        }

        let key = self.cache_key(access_key);
        let scope = QueryScope::Account {
            access_key: access_key.to_string(),
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
        debug!(
            "Account region lookup for {} finished: {}",
            access_key,
            lookup.status.as_str()
        );
        lookup.into_result()
    }

    pub fn invalidate(&self, access_key: &str) -> bool {
        self.cache.invalidate(&self.cache_key(access_key))
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

    fn resolver() -> AccountRegionResolver {
        let selector = Arc::new(HostSelector::new(SelectorOptions::default()));
        let discovery = Arc::new(
            DiscoveryClient::new(
                Endpoints::preferred_only(["uc.example.com"]),
                selector,
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        AccountRegionResolver::new(discovery, Arc::new(TtlCache::memory_only(ACCOUNT_CACHE_NAME)))
    }

    #[test]
    fn test_cache_key() {
        let resolver = resolver();
        assert_ne!(resolver.cache_key("AK1"), resolver.cache_key("AK2"));
        assert!(resolver.cache_key("AK1").starts_with("3:AK1:"));
        assert_ne!(resolver.cache_key("a:b"), resolver.cache_key("a"));
    }

    #[tokio::test]
    async fn test_empty_access_key() {
        let result = resolver().resolve_all("").await;
        assert!(matches!(result, Err(ResolveError::ConfigError(_))));
    }
}
