//! Integration tests for cache persistence across restarts

use endpoint_resolver::{
    CacheEntry, CacheOptions, CacheRegistry, EndpointResolver, Region, ResolverConfig, TtlCache,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn persistent_config(host: String, dir: &TempDir) -> ResolverConfig {
    let mut config = ResolverConfig::with_discovery_hosts([host]);
    config.cache.cache_dir = dir.path().to_string_lossy().into_owned();
    config
}

#[tokio::test]
async fn test_regions_survive_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v4/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hosts": [{
                "region": "z0",
                "ttl": 86400,
                "up": {"domains": ["upload.example.com"], "old": ["up.legacy.com"]}
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let config = persistent_config(server.uri(), &temp_dir);

    let before = {
        let registry = CacheRegistry::new();
        let resolver = EndpointResolver::new(&config, &registry).unwrap();
        let regions = resolver.resolve_bucket_regions("AK1", "my-bucket").await.unwrap();
        resolver.flush().await;
        regions
    };

    assert!(temp_dir.path().join("regions_v4.json").exists());
    assert!(temp_dir.path().join("regions_v4.lock").exists());

    // A new registry stands in for a new process
    let registry = CacheRegistry::new();
    let resolver = EndpointResolver::new(&config, &registry).unwrap();
    let after = resolver.resolve_bucket_regions("AK1", "my-bucket").await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_expired_entries_are_not_loaded() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("regions.json");

    let mut on_disk: HashMap<String, CacheEntry<Vec<Region>>> = HashMap::new();
    on_disk.insert(
        "expired".to_string(),
        CacheEntry::with_expiry(vec![Region::new("z0")], 1, None),
    );
    on_disk.insert(
        "valid".to_string(),
        CacheEntry::new(vec![Region::new("z1")], Duration::from_secs(3600)),
    );
    std::fs::write(&path, serde_json::to_vec(&on_disk).unwrap()).unwrap();

    let cache = TtlCache::<Vec<Region>>::new(CacheOptions::persistent("regions", &path)).unwrap();
    assert!(cache.peek("expired").is_none());
    assert_eq!(cache.peek("valid").unwrap().value[0].id, "z1");
}

#[tokio::test]
async fn test_corrupt_file_does_not_break_cache() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("regions.json");
    std::fs::write(&path, b"\x00 definitely not json").unwrap();

    let cache = TtlCache::<String>::new(CacheOptions::persistent("regions", &path)).unwrap();
    assert!(cache.is_empty());

    let lookup = cache
        .get("k", || async {
            Ok(CacheEntry::new("v".to_string(), Duration::from_secs(60)))
        })
        .await;
    assert_eq!(lookup.result.unwrap(), "v");

    cache.flush().await;
    let reopened: HashMap<String, CacheEntry<String>> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(reopened["k"].value, "v");
}

#[tokio::test]
async fn test_unwritable_directory_is_tolerated() {
    let temp_dir = TempDir::new().unwrap();
    // A file where the cache directory should be makes every write fail
    let blocker = temp_dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();

    let cache =
        TtlCache::<String>::new(CacheOptions::persistent("regions", blocker.join("c.json"))).unwrap();
    cache.insert("k", CacheEntry::new("v".to_string(), Duration::from_secs(60)));
    cache.flush().await;
    assert_eq!(cache.peek("k").unwrap().value, "v");
}

#[tokio::test]
async fn test_invalidate_removes_persisted_entry() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("regions.json");

    let cache = TtlCache::<String>::new(CacheOptions::persistent("regions", &path)).unwrap();
    cache.insert("a", CacheEntry::new("1".to_string(), Duration::from_secs(60)));
    cache.insert("b", CacheEntry::new("2".to_string(), Duration::from_secs(60)));
    cache.flush().await;

    cache.invalidate("a");
    cache.flush().await;

    let on_disk: HashMap<String, CacheEntry<String>> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(!on_disk.contains_key("a"));
    assert_eq!(on_disk["b"].value, "2");
}

#[tokio::test]
async fn test_registry_shares_persistent_caches() {
    let temp_dir = TempDir::new().unwrap();
    let config = persistent_config("uc.example.com".to_string(), &temp_dir);
    let registry = CacheRegistry::new();

    let _first = EndpointResolver::new(&config, &registry).unwrap();
    let _second = EndpointResolver::new(&config, &registry).unwrap();
    // bucket and account caches, each created once
    assert_eq!(registry.len(), 2);
}

fn read_file(path: &std::path::Path) -> HashMap<String, CacheEntry<String>> {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_persist_interval_writes_without_flush() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("regions.json");

    let cache = TtlCache::<String>::new(
        CacheOptions::persistent("regions", &path)
            .with_intervals(Duration::from_millis(100), Duration::from_secs(3600)),
    )
    .unwrap();
    cache.insert("k", CacheEntry::new("v".to_string(), Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_millis(500)).await;

    let on_disk = read_file(&path);
    assert_eq!(on_disk["k"].value, "v");
    // Still alive; the write came from the interval, not from drop
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_compact_interval_drops_expired_entries() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("regions.json");

    let cache = TtlCache::<String>::new(
        CacheOptions::persistent("regions", &path)
            .with_intervals(Duration::from_millis(50), Duration::from_millis(200)),
    )
    .unwrap();

    let now = endpoint_resolver::ttl_cache::now_ms();
    cache.insert(
        "short",
        CacheEntry::with_expiry("gone soon".to_string(), now + 700, None),
    );
    cache.insert("long", CacheEntry::new("kept".to_string(), Duration::from_secs(3600)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let on_disk = read_file(&path);
    assert!(on_disk.contains_key("short"));
    assert!(on_disk.contains_key("long"));
    assert_eq!(cache.len(), 2);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let on_disk = read_file(&path);
    assert!(!on_disk.contains_key("short"));
    assert_eq!(on_disk["long"].value, "kept");
    assert_eq!(cache.len(), 1);
}
