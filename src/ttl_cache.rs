//! Key/value memoization with expiry, single-flight misses and optional
//! on-disk persistence
//!
//! This module provides the cache every resolver sits on:
//! - Valid entries are served without touching the network
//! - Concurrent misses for one key share a single computation and its result
//! - Entries past their soft refresh time are recomputed eagerly, falling back
//!   to the still-valid value if that recompute fails
//! - Fresh entries are written behind to a JSON file by a background task,
//!   which also compacts the file on its own schedule

use crate::error::{ResolveError, Result};
use crate::persist::{JsonFileStore, PendingWrites};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Current wall clock as unix milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Bound for values the cache can hold and persist
pub trait CacheValue: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A cached value with its hard expiry and optional soft refresh time
///
/// Times are unix milliseconds so that entries survive a trip through the
/// persisted file unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at_ms: u64,
    #[serde(default)]
    pub refresh_at_ms: Option<u64>,
}

impl<V> CacheEntry<V> {
    /// Entry valid for `ttl`, due for refresh after half of it
    pub fn new(value: V, ttl: Duration) -> Self {
        let now = now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        CacheEntry {
            value,
            expires_at_ms: now.saturating_add(ttl_ms),
            refresh_at_ms: Some(now.saturating_add(ttl_ms / 2)),
        }
    }

    /// Entry valid for `ttl` with no soft refresh time
    pub fn without_refresh(value: V, ttl: Duration) -> Self {
        CacheEntry {
            value,
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            refresh_at_ms: None,
        }
    }

    /// Entry with explicit timestamps
    pub fn with_expiry(value: V, expires_at_ms: u64, refresh_at_ms: Option<u64>) -> Self {
        CacheEntry {
            value,
            expires_at_ms,
            refresh_at_ms,
        }
    }

    /// Whether the entry is valid right now
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_ms())
    }

    /// Whether the entry is valid at `now` (unix ms)
    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at_ms
    }

    /// Whether the soft refresh time has passed at `now` (unix ms)
    pub fn needs_refresh_at(&self, now: u64) -> bool {
        self.refresh_at_ms.map_or(false, |at| now >= at)
    }

    fn is_fresh_at(&self, now: u64) -> bool {
        self.is_valid_at(now) && !self.needs_refresh_at(now)
    }
}

/// Where a looked-up value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a valid cached entry
    Cached,
    /// Computed (by this caller or the one it waited on)
    Fresh,
    /// Nothing valid cached and the computation failed
    NoResult,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Cached => "cached",
            CacheStatus::Fresh => "fresh",
            CacheStatus::NoResult => "no_result",
        }
    }
}

/// Outcome of [`TtlCache::get`]
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub status: CacheStatus,
    pub result: Result<V>,
}

impl<V> Lookup<V> {
    fn cached(value: V) -> Self {
        Lookup {
            status: CacheStatus::Cached,
            result: Ok(value),
        }
    }

    fn fresh(value: V) -> Self {
        Lookup {
            status: CacheStatus::Fresh,
            result: Ok(value),
        }
    }

    fn no_result(err: ResolveError) -> Self {
        Lookup {
            status: CacheStatus::NoResult,
            result: Err(err),
        }
    }

    /// Drop the status and keep the value or error
    pub fn into_result(self) -> Result<V> {
        self.result
    }
}

/// Persistence and identity settings for a cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Name used in logs and metrics
    pub name: String,
    /// JSON file backing the cache; `None` keeps it memory only
    pub persist_path: Option<PathBuf>,
    /// How often buffered writes are flushed to disk
    pub persist_interval: Duration,
    /// How often the file is rewritten without expired entries
    pub compact_interval: Duration,
}

impl CacheOptions {
    /// Options for a cache that never touches disk
    pub fn memory_only(name: impl Into<String>) -> Self {
        CacheOptions {
            name: name.into(),
            persist_path: None,
            persist_interval: Duration::from_secs(60),
            compact_interval: Duration::from_secs(60),
        }
    }

    /// Options for a cache persisted to `path` with default intervals
    pub fn persistent(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        CacheOptions {
            persist_path: Some(path.into()),
            ..Self::memory_only(name)
        }
    }

    pub fn with_intervals(mut self, persist_interval: Duration, compact_interval: Duration) -> Self {
        self.persist_interval = persist_interval;
        self.compact_interval = compact_interval;
        self
    }

    /// Hash identifying the underlying store
    ///
    /// Persistent caches are identified by file and intervals only, so two
    /// names pointing at one file still share one instance.
    pub fn fingerprint(&self) -> u64 {
        let identity = match &self.persist_path {
            Some(path) => format!(
                "file|{}|{}|{}",
                path.display(),
                self.persist_interval.as_millis(),
                self.compact_interval.as_millis()
            ),
            None => format!("memory|{}", self.name),
        };
        xxhash_rust::xxh3::xxh3_64(identity.as_bytes())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub computes: u64,
    pub compute_errors: u64,
    pub coalesced: u64,
}

/// Message for the background persistence task
#[derive(Debug)]
enum PersistMessage<V> {
    Put { key: String, entry: CacheEntry<V> },
    Remove { key: String },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Slot shared by the leader of a miss and the callers waiting on it
type InflightSlot<V> = Option<Result<CacheEntry<V>>>;

enum Role<V> {
    Leader(watch::Sender<InflightSlot<V>>),
    Follower(watch::Receiver<InflightSlot<V>>),
}

/// Removes the in-flight marker for a key even if the leader is dropped
struct InflightGuard<'a, V> {
    inflight: &'a Mutex<HashMap<String, watch::Receiver<InflightSlot<V>>>>,
    key: &'a str,
}

impl<V> Drop for InflightGuard<'_, V> {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(self.key);
    }
}

/// TTL cache with single-flight computation and write-behind persistence
pub struct TtlCache<V> {
    name: String,
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
    inflight: Mutex<HashMap<String, watch::Receiver<InflightSlot<V>>>>,
    stats: RwLock<CacheStats>,
    writer_tx: Option<mpsc::UnboundedSender<PersistMessage<V>>>,
}

impl<V: CacheValue> TtlCache<V> {
    /// Create a cache that never touches disk
    pub fn memory_only(name: impl Into<String>) -> Self {
        TtlCache {
            name: name.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            inflight: Mutex::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            writer_tx: None,
        }
    }

    /// Create a cache from options
    ///
    /// A persistent cache loads the still-valid entries from its file and
    /// spawns its writer task, so it must be created inside a tokio runtime.
    ///
    /// The load takes a shared `flock` on the lock file and reads the file on
    /// the calling thread, so it blocks while another process holds the lock
    /// for a write. Create caches at startup, not on a hot async path; all
    /// later disk work runs on the writer task via `spawn_blocking`.
    pub fn new(options: CacheOptions) -> Result<Self> {
        let path = match &options.persist_path {
            Some(path) => path.clone(),
            None => return Ok(Self::memory_only(options.name)),
        };

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ResolveError::ConfigError(format!(
                "persistent cache '{}' must be created inside a tokio runtime",
                options.name
            ))
        })?;

        let store = Arc::new(JsonFileStore::new(&path));
        let mut initial = HashMap::new();
        match store.load::<V>() {
            Ok(loaded) => {
                let now = now_ms();
                initial.extend(loaded.into_iter().filter(|(_, e)| e.is_valid_at(now)));
            }
            Err(e) => warn!("Failed to load {} cache from {}: {}", options.name, path.display(), e),
        }

        info!(
            "Initializing {} cache: {} entries loaded from {:?}",
            options.name,
            initial.len(),
            path
        );

        let entries = Arc::new(RwLock::new(initial));
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(writer_task(
            options.name.clone(),
            rx,
            store,
            entries.clone(),
            options.persist_interval,
            options.compact_interval,
        ));

        Ok(TtlCache {
            name: options.name,
            entries,
            inflight: Mutex::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            writer_tx: Some(tx),
        })
    }

    /// Name of this cache
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the value for `key`, computing it on a miss
    ///
    /// `compute` runs at most once per concurrent miss window for a key:
    /// callers arriving while it runs wait for it and receive its result or
    /// its error. Callers that already hold a valid entry never wait; while
    /// another caller refreshes that entry they are served the cached value.
    /// Failures are never cached.
    pub async fn get<F, Fut>(&self, key: &str, compute: F) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry<V>>>,
    {
        let now = now_ms();
        let current = self.valid_entry(key, now);

        match &current {
            Some(entry) if !entry.needs_refresh_at(now) => {
                self.stats.write().unwrap().hits += 1;
                debug!("{} cache hit: {}", self.name, key);
                return Lookup::cached(entry.value.clone());
            }
            Some(_) => {
                self.stats.write().unwrap().refreshes += 1;
                debug!("{} cache entry due for refresh: {}", self.name, key);
            }
            None => {
                self.stats.write().unwrap().misses += 1;
                debug!("{} cache miss: {}", self.name, key);
            }
        }

        match self.compute_once(key, current.as_ref(), compute).await {
            Ok((entry, status)) => Lookup {
                status,
                result: Ok(entry.value),
            },
            Err(err) => match current {
                Some(stale) if stale.is_valid() => {
                    warn!(
                        "Refresh of {} cache entry {} failed, serving cached value: {}",
                        self.name, key, err
                    );
                    Lookup::cached(stale.value)
                }
                _ => Lookup::no_result(err),
            },
        }
    }

    /// Run `compute` as the single leader for `key`, or wait on the leader
    ///
    /// A caller passing a valid `current` entry does not wait when a compute
    /// is already running; it gets `current` back as [`CacheStatus::Cached`].
    async fn compute_once<F, Fut>(
        &self,
        key: &str,
        current: Option<&CacheEntry<V>>,
        compute: F,
    ) -> Result<(CacheEntry<V>, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry<V>>>,
    {
        let role = {
            let mut inflight = self.inflight.lock().unwrap();
            let running = inflight.get(key).cloned();
            match (running, current) {
                (Some(_), Some(entry)) => {
                    debug!("{} cache refresh already running, serving cached: {}", self.name, key);
                    return Ok((entry.clone(), CacheStatus::Cached));
                }
                (Some(rx), None) => Role::Follower(rx),
                (None, _) => {
                    // A leader may have stored its result between our first
                    // look and taking this lock
                    let now = now_ms();
                    if let Some(entry) = self.valid_entry(key, now) {
                        if entry.is_fresh_at(now) {
                            return Ok((entry, CacheStatus::Fresh));
                        }
                    }
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        let result = match role {
            Role::Leader(tx) => {
                let guard = InflightGuard {
                    inflight: &self.inflight,
                    key,
                };
                self.stats.write().unwrap().computes += 1;

                let result = compute().await;
                match &result {
                    Ok(entry) => self.store(key, entry.clone()),
                    Err(e) => {
                        self.stats.write().unwrap().compute_errors += 1;
                        debug!("{} cache compute failed for {}: {}", self.name, key, e);
                    }
                }

                drop(guard);
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Follower(mut rx) => {
                self.stats.write().unwrap().coalesced += 1;
                debug!("{} cache waiting on in-flight compute: {}", self.name, key);

                let slot = rx.wait_for(|slot| slot.is_some()).await.map(|slot| slot.clone());
                match slot {
                    Ok(Some(result)) => result,
                    Ok(None) | Err(_) => Err(ResolveError::Cancelled(format!(
                        "{} lookup for {} was abandoned",
                        self.name, key
                    ))),
                }
            }
        };
        result.map(|entry| (entry, CacheStatus::Fresh))
    }

    /// Current valid entry for `key`, if any
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.valid_entry(key, now_ms())
    }

    fn valid_entry(&self, key: &str, now: u64) -> Option<CacheEntry<V>> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .filter(|e| e.is_valid_at(now))
            .cloned()
    }

    /// Store an entry, replacing any previous one, and queue it for disk
    pub fn insert(&self, key: &str, entry: CacheEntry<V>) {
        self.store(key, entry);
    }

    fn store(&self, key: &str, entry: CacheEntry<V>) {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), entry.clone());

        if let Some(tx) = &self.writer_tx {
            let _ = tx.send(PersistMessage::Put {
                key: key.to_string(),
                entry,
            });
        }
    }

    /// Drop the entry for `key` from memory and disk
    ///
    /// # Returns
    /// `true` if an entry was present in memory
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.write().unwrap().remove(key).is_some();
        if let Some(tx) = &self.writer_tx {
            let _ = tx.send(PersistMessage::Remove {
                key: key.to_string(),
            });
        }
        debug!("Invalidated {} cache entry {} (present: {})", self.name, key, removed);
        removed
    }

    /// Write buffered entries to disk now and wait for it to finish
    ///
    /// Memory-only caches return immediately.
    pub async fn flush(&self) {
        if let Some(tx) = &self.writer_tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PersistMessage::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Number of entries held in memory, valid or not
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().unwrap().clone();
        stats.entries = self.len();
        stats
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        if let Some(tx) = &self.writer_tx {
            let _ = tx.send(PersistMessage::Shutdown);
        }
        debug!("{} cache dropped", self.name);
    }
}

/// Background task owning the cache file
async fn writer_task<V: CacheValue>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<PersistMessage<V>>,
    store: Arc<JsonFileStore>,
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
    persist_interval: Duration,
    compact_interval: Duration,
) {
    debug!("{} cache writer started for {}", name, store.path().display());

    let mut pending: PendingWrites<V> = HashMap::new();
    let mut persist_tick = tokio::time::interval(persist_interval);
    let mut compact_tick = tokio::time::interval(compact_interval);
    persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    compact_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately on the first tick
    persist_tick.tick().await;
    compact_tick.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(PersistMessage::Put { key, entry }) => {
                    pending.insert(key, Some(entry));
                }
                Some(PersistMessage::Remove { key }) => {
                    pending.insert(key, None);
                }
                Some(PersistMessage::Flush(done)) => {
                    flush_pending(&name, &store, &mut pending).await;
                    let _ = done.send(());
                }
                Some(PersistMessage::Shutdown) | None => {
                    flush_pending(&name, &store, &mut pending).await;
                    debug!("{} cache writer shutting down", name);
                    break;
                }
            },
            _ = persist_tick.tick() => {
                flush_pending(&name, &store, &mut pending).await;
            }
            _ = compact_tick.tick() => {
                compact(&name, &store, &entries).await;
            }
        }
    }
}

async fn flush_pending<V: CacheValue>(
    name: &str,
    store: &Arc<JsonFileStore>,
    pending: &mut PendingWrites<V>,
) {
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.apply(batch)).await {
        Ok(Ok(changed)) => debug!("{} cache flushed {} changed entries", name, changed),
        Ok(Err(e)) => warn!("Failed to persist {} cache: {}", name, e),
        Err(e) => error!("{} cache persistence task failed: {}", name, e),
    }
}

async fn compact<V: CacheValue>(
    name: &str,
    store: &Arc<JsonFileStore>,
    entries: &Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
) {
    {
        let now = now_ms();
        entries.write().unwrap().retain(|_, e| e.is_valid_at(now));
    }

    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.compact::<V>()).await {
        Ok(Ok(removed)) if removed > 0 => info!("Compacted {} cache: {} expired entries dropped", name, removed),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Failed to compact {} cache: {}", name, e),
        Err(e) => error!("{} cache compaction task failed: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(
        counter: &Arc<AtomicUsize>,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<CacheEntry<String>>> {
        let counter = counter.clone();
        let value = value.to_string();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CacheEntry::new(value, ttl))
        }
    }

    #[tokio::test]
    async fn test_hit_does_not_compute() {
        let cache = TtlCache::<String>::memory_only("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get("k", || counted(&counter, "v1", Duration::from_secs(60)))
            .await;
        assert_eq!(first.status, CacheStatus::Fresh);
        assert_eq!(first.result.unwrap(), "v1");

        let second = cache
            .get("k", || counted(&counter, "v2", Duration::from_secs(60)))
            .await;
        assert_eq!(second.status, CacheStatus::Cached);
        assert_eq!(second.result.unwrap(), "v1");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_recomputed() {
        let cache = TtlCache::<String>::memory_only("test");
        cache.insert(
            "k",
            CacheEntry::with_expiry("old".to_string(), now_ms() - 1, None),
        );
        assert!(cache.peek("k").is_none());

        let counter = Arc::new(AtomicUsize::new(0));
        let lookup = cache
            .get("k", || counted(&counter, "new", Duration::from_secs(60)))
            .await;
        assert_eq!(lookup.status, CacheStatus::Fresh);
        assert_eq!(lookup.result.unwrap(), "new");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_once() {
        let cache = Arc::new(TtlCache::<String>::memory_only("test"));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get("k", || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(CacheEntry::new("shared".to_string(), Duration::from_secs(60)))
                    })
                    .await
            }));
        }

        for task in tasks {
            let lookup = task.await.unwrap();
            assert_eq!(lookup.result.unwrap(), "shared");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = Arc::new(TtlCache::<String>::memory_only("test"));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get("k", || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(ResolveError::Transport("down".to_string()))
                    })
                    .await
            }));
        }

        for task in tasks {
            let lookup = task.await.unwrap();
            assert_eq!(lookup.status, CacheStatus::NoResult);
            assert_eq!(
                lookup.result.unwrap_err(),
                ResolveError::Transport("down".to_string())
            );
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        let lookup = cache
            .get("k", || counted(&counter, "up", Duration::from_secs(60)))
            .await;
        assert_eq!(lookup.result.unwrap(), "up");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_soft_refresh_recomputes() {
        let cache = TtlCache::<String>::memory_only("test");
        let now = now_ms();
        cache.insert(
            "k",
            CacheEntry::with_expiry("old".to_string(), now + 60_000, Some(now - 1)),
        );

        let counter = Arc::new(AtomicUsize::new(0));
        let lookup = cache
            .get("k", || counted(&counter, "new", Duration::from_secs(60)))
            .await;
        assert_eq!(lookup.status, CacheStatus::Fresh);
        assert_eq!(lookup.result.unwrap(), "new");
        assert_eq!(cache.stats().refreshes, 1);
    }

    #[tokio::test]
    async fn test_soft_refresh_failure_serves_cached_value() {
        let cache = TtlCache::<String>::memory_only("test");
        let now = now_ms();
        cache.insert(
            "k",
            CacheEntry::with_expiry("old".to_string(), now + 60_000, Some(now - 1)),
        );

        let lookup = cache
            .get("k", || async { Err(ResolveError::Transport("down".to_string())) })
            .await;
        assert_eq!(lookup.status, CacheStatus::Cached);
        assert_eq!(lookup.result.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_refresh_in_flight_does_not_block_holders_of_valid_entry() {
        let cache = Arc::new(TtlCache::<String>::memory_only("test"));
        let now = now_ms();
        cache.insert(
            "k",
            CacheEntry::with_expiry("old".to_string(), now + 60_000, Some(now - 1)),
        );

        let refresher_cache = cache.clone();
        let refresher = tokio::spawn(async move {
            refresher_cache
                .get("k", || async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(CacheEntry::new("new".to_string(), Duration::from_secs(60)))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let lookup = cache
            .get("k", || async {
                Err(ResolveError::Cancelled("must not compute twice".to_string()))
            })
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(lookup.status, CacheStatus::Cached);
        assert_eq!(lookup.result.unwrap(), "old");

        let refreshed = refresher.await.unwrap();
        assert_eq!(refreshed.status, CacheStatus::Fresh);
        assert_eq!(refreshed.result.unwrap(), "new");
        assert_eq!(cache.peek("k").unwrap().value, "new");
    }

    #[tokio::test]
    async fn test_abandoned_leader_fails_waiters() {
        let cache = Arc::new(TtlCache::<String>::memory_only("test"));

        let leader_cache = cache.clone();
        let leader = tokio::spawn(async move {
            leader_cache
                .get("k", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(CacheEntry::new("never".to_string(), Duration::from_secs(60)))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let follower_cache = cache.clone();
        let follower = tokio::spawn(async move {
            follower_cache
                .get("k", || async {
                    Ok(CacheEntry::new("follower".to_string(), Duration::from_secs(60)))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();
        let lookup = follower.await.unwrap();
        assert_eq!(lookup.status, CacheStatus::NoResult);
        assert!(matches!(lookup.result, Err(ResolveError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = TtlCache::<String>::memory_only("test");
        cache.insert("k", CacheEntry::new("v".to_string(), Duration::from_secs(60)));
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert!(cache.peek("k").is_none());
    }

    #[test]
    fn test_entry_timestamps() {
        let entry = CacheEntry::new(1u32, Duration::from_secs(10));
        let now = now_ms();
        assert!(entry.is_valid_at(now));
        assert!(!entry.needs_refresh_at(now));
        assert!(entry.needs_refresh_at(now + 5_000));
        assert!(!entry.is_valid_at(entry.expires_at_ms));

        let plain = CacheEntry::without_refresh(1u32, Duration::from_secs(10));
        assert!(!plain.needs_refresh_at(now + 9_000));
    }

    #[test]
    fn test_fingerprint_identity() {
        let a = CacheOptions::persistent("a", "/tmp/x.json");
        let b = CacheOptions::persistent("b", "/tmp/x.json");
        let c = CacheOptions::persistent("a", "/tmp/x.json")
            .with_intervals(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(
            CacheOptions::memory_only("a").fingerprint(),
            CacheOptions::memory_only("b").fingerprint()
        );
    }

    #[test]
    fn test_persistent_cache_needs_runtime() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let options = CacheOptions::persistent("test", temp_dir.path().join("c.json"));
        assert!(matches!(
            TtlCache::<String>::new(options),
            Err(ResolveError::ConfigError(_))
        ));
    }
}
