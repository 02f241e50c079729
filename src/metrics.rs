//! Prometheus metrics for region resolution and host failover

use crate::error::ResolveError;
use crate::host_selector::{AttemptTarget, SelectorObserver};
use crate::ttl_cache::CacheStatus;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Instant;

/// Metrics for resolvers and selectors
#[derive(Clone)]
pub struct ResolverMetrics {
    /// Region lookups by cache and outcome
    pub cache_lookups_total: IntCounterVec,

    /// Discovery queries by scope and result
    pub discovery_queries_total: IntCounterVec,

    /// Attempts against hosts by result
    pub host_attempts_total: IntCounterVec,

    /// Hosts frozen after a failure
    pub host_freezes_total: IntCounter,

    registry: Registry,
}

impl ResolverMetrics {
    /// Create metrics on a fresh private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(&Registry::new())
    }

    /// Create metrics with custom registry
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let cache_lookups_total = IntCounterVec::new(
            Opts::new(
                "endpoint_resolver_cache_lookups_total",
                "Total number of region cache lookups",
            ),
            &["cache", "status"], // status: cached, fresh, no_result
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let discovery_queries_total = IntCounterVec::new(
            Opts::new(
                "endpoint_resolver_discovery_queries_total",
                "Total number of discovery queries sent",
            ),
            &["scope", "result"], // scope: bucket, account
        )?;
        registry.register(Box::new(discovery_queries_total.clone()))?;

        let host_attempts_total = IntCounterVec::new(
            Opts::new(
                "endpoint_resolver_host_attempts_total",
                "Total number of request attempts against hosts",
            ),
            &["result"],
        )?;
        registry.register(Box::new(host_attempts_total.clone()))?;

        let host_freezes_total = IntCounter::new(
            "endpoint_resolver_host_freezes_total",
            "Total number of hosts frozen after a failure",
        )?;
        registry.register(Box::new(host_freezes_total.clone()))?;

        Ok(Self {
            cache_lookups_total,
            discovery_queries_total,
            host_attempts_total,
            host_freezes_total,
            registry: registry.clone(),
        })
    }

    pub fn record_cache_lookup(&self, cache: &str, status: CacheStatus) {
        self.cache_lookups_total
            .with_label_values(&[cache, status.as_str()])
            .inc();
    }

    pub fn record_discovery(&self, scope: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.discovery_queries_total
            .with_label_values(&[scope, result])
            .inc();
    }

    /// Render every metric of the registry in text exposition format
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl SelectorObserver for ResolverMetrics {
    fn after_attempt(&self, _target: &AttemptTarget, error: Option<&ResolveError>) {
        let result = if error.is_none() { "success" } else { "failure" };
        self.host_attempts_total.with_label_values(&[result]).inc();
    }

    fn on_host_frozen(&self, _host: &str, _until: Instant) {
        self.host_freezes_total.inc();
    }
}
