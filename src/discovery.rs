//! Discovery queries against the region service
//!
//! One client serves both the bucket-scoped query (`/v4/query`) and the
//! account-wide query (`/regions`). Every query runs through a
//! [`HostSelector`], so an unavailable discovery host is frozen and the next
//! one is tried.

use crate::endpoint::{Endpoints, Region, RegionsResponse};
use crate::error::{ResolveError, Result};
use crate::host_selector::HostSelector;
use crate::ttl_cache::CacheEntry;
use reqwest::{Client, RequestBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decorates discovery requests, e.g. to sign them for an account
pub trait RequestAuthorizer: Send + Sync {
    fn authorize(&self, request: RequestBuilder, access_key: &str) -> RequestBuilder;
}

/// What a discovery query asks about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Regions serving one bucket
    Bucket { access_key: String, bucket: String },
    /// Every region visible to an account
    Account { access_key: String },
}

impl QueryScope {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            QueryScope::Bucket { .. } => "bucket",
            QueryScope::Account { .. } => "account",
        }
    }

    pub fn access_key(&self) -> &str {
        match self {
            QueryScope::Bucket { access_key, .. } | QueryScope::Account { access_key } => access_key,
        }
    }
}

/// Client for the discovery service
pub struct DiscoveryClient {
    client: Client,
    hosts: Endpoints,
    selector: Arc<HostSelector>,
    authorizer: Option<Arc<dyn RequestAuthorizer>>,
}

impl DiscoveryClient {
    /// Create a client for `hosts` with a per-request timeout
    pub fn new(hosts: Endpoints, selector: Arc<HostSelector>, timeout: Duration) -> Result<Self> {
        if hosts.is_empty() {
            return Err(ResolveError::NoEndpoints);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(DiscoveryClient {
            client,
            hosts,
            selector,
            authorizer: None,
        })
    }

    /// Attach a request authorizer
    pub fn with_authorizer(mut self, authorizer: Arc<dyn RequestAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Configured discovery hosts
    pub fn hosts(&self) -> &Endpoints {
        &self.hosts
    }

    /// Selector the queries run through
    pub fn selector(&self) -> &HostSelector {
        &self.selector
    }

    /// Run a discovery query with host failover
    ///
    /// # Returns
    /// * `Ok(RegionsResponse)` with at least one region
    /// * `Err(ResolveError::NoRegion)` if the service returned no region
    /// * `Err(e)` from the last discovery host tried otherwise
    pub async fn query(&self, scope: &QueryScope) -> Result<RegionsResponse> {
        let response = self
            .selector
            .select_and_do(&self.hosts, move |target| self.query_host(target.url, scope))
            .await?;

        if response.hosts.is_empty() {
            return Err(ResolveError::NoRegion(match scope {
                QueryScope::Bucket { bucket, .. } => format!("discovery returned no region for bucket {}", bucket),
                QueryScope::Account { access_key } => {
                    format!("discovery returned no region for access key {}", access_key)
                }
            }));
        }
        Ok(response)
    }

    async fn query_host(&self, base_url: String, scope: &QueryScope) -> Result<RegionsResponse> {
        let request = match scope {
            QueryScope::Bucket { access_key, bucket } => self
                .client
                .get(format!("{}/v4/query", base_url))
                .query(&[("ak", access_key.as_str()), ("bucket", bucket.as_str())]),
            QueryScope::Account { .. } => self.client.get(format!("{}/regions", base_url)),
        };
        let request = match &self.authorizer {
            Some(authorizer) => authorizer.authorize(request, scope.access_key()),
            None => request,
        };

        debug!("Sending {} discovery query to {}", scope.label(), base_url);
        let response = request.send().await.map_err(|e| {
            warn!("Discovery request to {} failed: {}", base_url, e);
            ResolveError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(
                "Discovery host {} returned status={}: {}",
                base_url, status, message
            );
            return Err(ResolveError::from_http_status(status.as_u16(), message));
        }

        let body = response.bytes().await.map_err(ResolveError::from)?;
        let decoded: RegionsResponse = serde_json::from_slice(&body).map_err(|e| {
            warn!("Malformed discovery response from {}: {}", base_url, e);
            ResolveError::Decode(format!("Malformed discovery response: {}", e))
        })?;

        info!(
            "Discovery query ({}) via {} returned {} regions",
            scope.label(),
            base_url,
            decoded.hosts.len()
        );
        Ok(decoded)
    }
}

/// Cache entry for a discovery response
///
/// Expires after the smallest TTL among the returned regions and is due for
/// refresh after half of it.
pub fn regions_entry(response: RegionsResponse) -> Result<CacheEntry<Vec<Region>>> {
    let ttl = response
        .min_ttl()
        .ok_or_else(|| ResolveError::NoRegion("discovery returned no region".to_string()))?;
    Ok(CacheEntry::new(response.into_regions(), Duration::from_secs(ttl)))
}
