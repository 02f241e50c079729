//! Endpoint resolver command line
//!
//! Loads a configuration, resolves the regions of an account (or of one of
//! its buckets) and prints them as JSON.

use anyhow::{bail, Context};
use endpoint_resolver::{CacheRegistry, EndpointResolver, ResolverConfig};
use std::env;
use tracing::{error, info};

/// # Usage
/// ```bash
/// endpoint-resolver endpoint_resolver.yaml <access-key>            # all regions
/// endpoint-resolver endpoint_resolver.yaml <access-key> <bucket>   # one bucket
/// ```
#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(env::args().skip(1).collect()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let (config_path, access_key, bucket) = match args.as_slice() {
        [config, ak] => (config, ak, None),
        [config, ak, bucket] => (config, ak, Some(bucket)),
        _ => bail!("usage: endpoint-resolver <config.yaml> <access-key> [bucket]"),
    };

    info!("Loading configuration from: {}", config_path);
    let config = ResolverConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path))?;
    info!("  - Discovery hosts: {:?}", config.discovery_hosts);
    info!("  - Static regions: {}", config.static_regions.len());
    info!("  - Persistence: {}", config.cache.enable_persistence);

    let registry = CacheRegistry::new();
    let resolver = EndpointResolver::new(&config, &registry)?;

    let regions = match bucket {
        Some(bucket) => resolver.resolve_bucket_regions(access_key, bucket).await?,
        None => resolver.resolve_all_regions(access_key).await?,
    };
    resolver.flush().await;

    println!("{}", serde_json::to_string_pretty(&regions)?);
    Ok(())
}
