//! Caller-owned registry de-duplicating cache instances
//!
//! Caches configured with the same persistence parameters share one
//! instance, so one process never runs two writers against the same file.
//! Create one registry per application (or per test) and pass it by
//! reference to whatever builds resolvers.

use crate::error::{ResolveError, Result};
use crate::ttl_cache::{CacheOptions, CacheValue, TtlCache};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Registry of live caches keyed by the fingerprint of their options
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl CacheRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cache for `options`, creating it on first use
    ///
    /// # Returns
    /// * `Ok(cache)` shared with every earlier caller using equal options
    /// * `Err(ResolveError::ConfigError)` if those options are already bound
    ///   to a cache of another value type, or the cache cannot be created
    pub fn get_or_create<V: CacheValue>(&self, options: CacheOptions) -> Result<Arc<TtlCache<V>>> {
        let fingerprint = options.fingerprint();
        let mut caches = self.caches.lock().unwrap();

        if let Some(existing) = caches.get(&fingerprint) {
            debug!("Reusing {} cache instance {:016x}", options.name, fingerprint);
            return existing.clone().downcast::<TtlCache<V>>().map_err(|_| {
                ResolveError::ConfigError(format!(
                    "cache '{}' ({:?}) is already registered with a different value type",
                    options.name, options.persist_path
                ))
            });
        }

        let cache = Arc::new(TtlCache::<V>::new(options)?);
        caches.insert(fingerprint, cache.clone());
        Ok(cache)
    }

    /// Number of distinct caches created so far
    pub fn len(&self) -> usize {
        self.caches.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
