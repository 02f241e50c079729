//! Endpoint Resolver
//!
//! Region discovery, endpoint caching and host failover for an object-storage
//! client. Given an access key (and optionally a bucket), it works out which
//! hosts serve each backend service, keeps that mapping fresh with as little
//! network traffic as possible, persists it across restarts and fails over
//! when a host misbehaves.
//!
//! # Features
//!
//! - **TTL Cache**: expiring entries with single-flight misses and soft refresh
//! - **Persistence**: write-behind JSON files guarded by a cross-process file lock
//! - **Bucket and Account Resolvers**: cached discovery queries per bucket or account
//! - **Host Failover**: tiered host lists with temporary freezing of failed hosts
//! - **Metrics Collection**: Prometheus counters for lookups, queries and attempts
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use endpoint_resolver::{CacheRegistry, EndpointResolver, ResolverConfig, ServiceName};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResolverConfig::from_file("endpoint_resolver.yaml")?;
//! let registry = CacheRegistry::new();
//! let resolver = EndpointResolver::new(&config, &registry)?;
//!
//! let regions = resolver.resolve_bucket_regions("my-access-key", "my-bucket").await?;
//! println!("bucket lives in {}", regions[0].id);
//!
//! let status = resolver
//!     .bucket_service_do("my-access-key", "my-bucket", ServiceName::Up, |target| async move {
//!         // send the real request to target.url here
//!         Ok(target.url)
//!     })
//!     .await?;
//! println!("uploaded via {}", status);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`EndpointResolver`]: facade wiring everything below from a [`ResolverConfig`]
//! - [`BucketRegionResolver`] / [`AccountRegionResolver`]: cached discovery lookups
//! - [`DiscoveryClient`]: the discovery HTTP queries, run through a selector
//! - [`HostSelector`]: failover across tiered hosts with freeze records
//! - [`TtlCache`]: the cache store, de-duplicated per process by [`CacheRegistry`]
//! - [`ResolverMetrics`]: Prometheus counters, also a selector observer
//!
//! # Configuration
//!
//! ```yaml
//! discovery_hosts:
//!   - uc.example.com
//! backup_discovery_hosts:
//!   - uc-backup.example.com
//! host_freeze_secs: 600
//! cache:
//!   cache_dir: /var/cache/endpoint-resolver
//!   persist_interval_secs: 60
//! ```
//!
//! See [`ResolverConfig`] for every option.

pub mod account_resolver;
pub mod bucket_resolver;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod host_selector;
pub mod metrics;
pub mod persist;
pub mod registry;
pub mod resolver;
pub mod ttl_cache;

// Re-export commonly used types
pub use account_resolver::AccountRegionResolver;
pub use bucket_resolver::BucketRegionResolver;
pub use config::{CacheConfig, ResolverConfig};
pub use discovery::{DiscoveryClient, QueryScope, RequestAuthorizer};
pub use dns::{CachedResolver, HostResolver, InOrderChooser, IpChooser, ShuffleChooser, SystemResolver};
pub use endpoint::{Endpoints, Region, ServiceName};
pub use error::{AttemptVerdict, ResolveError, Result};
pub use host_selector::{
    AttemptTarget, DefaultFreezePolicy, FreezePolicy, HostSelector, RetryPolicy, SelectorObserver,
    SelectorOptions,
};
pub use metrics::ResolverMetrics;
pub use registry::CacheRegistry;
pub use resolver::EndpointResolver;
pub use ttl_cache::{CacheEntry, CacheOptions, CacheStats, CacheStatus, Lookup, TtlCache};
