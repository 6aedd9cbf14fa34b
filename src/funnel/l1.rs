//! L1 - Per-Resource Local Cache
//!
//! In-process hot cache. Each resource owns an independent bounded, TTL'd
//! cache instance so keys never collide across resources.
//!
//! # Design
//!
//! - Registry of `resource -> Arc<ResourceCache>` in a `DashMap`
//! - Each instance is a `moka` cache (TinyLFU admission, expire-after-write)
//! - Rebuild swaps the whole instance; readers holding the old `Arc` finish
//!   against the old one

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;
use tracing::{debug, info, warn};

use super::context::{CacheKey, CacheValue, Context};
use crate::rule::L1Config;

/// One resource's local cache instance.
pub struct ResourceCache {
    entries: Cache<CacheKey, CacheValue>,
    config: L1Config,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceCache {
    fn build(config: &L1Config) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl())
                .build(),
            config: config.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &L1Config {
        &self.config
    }

    fn drain(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

/// L1 local cache registry
#[derive(Default)]
pub struct LocalCache {
    caches: DashMap<String, Arc<ResourceCache>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the instance for `resource` unless one already exists.
    pub fn get_or_create(&self, resource: &str, config: &L1Config) -> Arc<ResourceCache> {
        self.caches
            .entry(resource.to_string())
            .or_insert_with(|| {
                info!(
                    resource,
                    max_entries = config.max_entries,
                    ttl_secs = config.ttl_secs,
                    "Building L1 cache"
                );
                Arc::new(ResourceCache::build(config))
            })
            .clone()
    }

    /// Replace the instance for `resource`, draining the old one.
    pub fn rebuild(&self, resource: &str, config: &L1Config) {
        info!(resource, "Rebuilding L1 cache");
        let fresh = Arc::new(ResourceCache::build(config));
        if let Some(old) = self.caches.insert(resource.to_string(), fresh) {
            old.drain();
        }
    }

    /// Drop the instance for `resource` entirely.
    pub fn remove(&self, resource: &str) {
        if let Some((_, old)) = self.caches.remove(resource) {
            old.drain();
            info!(resource, "Removed L1 cache");
        }
    }

    /// Look up a value.
    pub fn get(&self, ctx: &Context) -> Option<CacheValue> {
        let cache = self.caches.get(ctx.resource())?.clone();

        match cache.entries.get(ctx.key()) {
            Some(value) => {
                cache.hits.fetch_add(1, Ordering::Relaxed);
                debug!(resource = ctx.resource(), key = %ctx.key(), "L1 hit");
                Some(value)
            }
            None => {
                cache.misses.fetch_add(1, Ordering::Relaxed);
                debug!(resource = ctx.resource(), key = %ctx.key(), "L1 miss");
                None
            }
        }
    }

    /// Store a value. Returns false when the resource has no L1 instance.
    pub fn put(&self, ctx: &Context, value: CacheValue) -> bool {
        let Some(cache) = self.caches.get(ctx.resource()).map(|c| c.clone()) else {
            warn!(resource = ctx.resource(), "L1 cache not configured, skipping put");
            return false;
        };

        cache.entries.insert(ctx.key().clone(), value);
        debug!(resource = ctx.resource(), key = %ctx.key(), "L1 put");
        true
    }

    /// Drop one key.
    pub fn invalidate(&self, ctx: &Context) {
        if let Some(cache) = self.caches.get(ctx.resource()) {
            cache.entries.invalidate(ctx.key());
            debug!(resource = ctx.resource(), key = %ctx.key(), "L1 invalidated");
        }
    }

    /// Drop every key of a resource but keep the instance.
    pub fn invalidate_resource(&self, resource: &str) {
        if let Some(cache) = self.caches.get(resource) {
            cache.drain();
            info!(resource, "L1 cache cleared");
        }
    }

    /// Whether `resource` has an L1 instance.
    pub fn contains_resource(&self, resource: &str) -> bool {
        self.caches.contains_key(resource)
    }

    /// Config of the live instance for `resource`.
    pub fn config(&self, resource: &str) -> Option<L1Config> {
        self.caches.get(resource).map(|c| c.config.clone())
    }

    /// Statistics for one resource.
    pub fn stats(&self, resource: &str) -> Option<L1Stats> {
        let cache = self.caches.get(resource)?.clone();
        cache.entries.run_pending_tasks();

        let hits = cache.hits.load(Ordering::Relaxed);
        let misses = cache.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        Some(L1Stats {
            resource: resource.to_string(),
            entries: cache.entries.entry_count(),
            max_entries: cache.config.max_entries,
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        })
    }

    /// Names of every resource with an instance.
    pub fn resources(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }
}

/// L1 statistics for one resource
#[derive(Debug, Clone)]
pub struct L1Stats {
    pub resource: String,
    /// Number of entries
    pub entries: u64,
    /// Configured capacity
    pub max_entries: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(max_entries: u64, ttl_secs: u64) -> L1Config {
        L1Config {
            max_entries,
            ttl_secs,
            enabled: true,
        }
    }

    #[test]
    fn test_put_get_per_resource() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 60));
        cache.get_or_create("user", &config(100, 60));

        let product = Context::new("product", "1");
        let user = Context::new("user", "1");

        assert!(cache.put(&product, json!({"name": "lamp"})));
        assert_eq!(cache.get(&product), Some(json!({"name": "lamp"})));
        // Same key, different resource
        assert_eq!(cache.get(&user), None);
    }

    #[test]
    fn test_put_without_instance_is_skipped() {
        let cache = LocalCache::new();
        let ctx = Context::new("unknown", "1");
        assert!(!cache.put(&ctx, json!(1)));
        assert_eq!(cache.get(&ctx), None);
    }

    #[test]
    fn test_get_or_create_keeps_existing_instance() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 60));
        let ctx = Context::new("product", "1");
        cache.put(&ctx, json!("v"));

        cache.get_or_create("product", &config(5, 5));
        assert_eq!(cache.get(&ctx), Some(json!("v")));
        assert_eq!(cache.config("product").unwrap().max_entries, 100);
    }

    #[test]
    fn test_rebuild_discards_entries() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 60));
        let ctx = Context::new("product", "1");
        cache.put(&ctx, json!("v"));

        cache.rebuild("product", &config(50, 60));
        assert_eq!(cache.get(&ctx), None);
        assert_eq!(cache.config("product").unwrap().max_entries, 50);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 60));
        let a = Context::new("product", "a");
        let b = Context::new("product", "b");
        cache.put(&a, json!(1));
        cache.put(&b, json!(2));

        cache.invalidate(&a);
        assert_eq!(cache.get(&a), None);
        assert_eq!(cache.get(&b), Some(json!(2)));

        cache.invalidate_resource("product");
        assert_eq!(cache.get(&b), None);
        assert!(cache.contains_resource("product"));

        cache.remove("product");
        assert!(!cache.contains_resource("product"));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 1));
        let ctx = Context::new("product", "1");
        cache.put(&ctx, json!("v"));
        assert!(cache.get(&ctx).is_some());

        std::thread::sleep(Duration::from_millis(1_100));
        assert_eq!(cache.get(&ctx), None);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(10, 60));
        for i in 0..200u64 {
            cache.put(&Context::new("product", i), json!(i));
        }
        let stats = cache.stats("product").unwrap();
        assert!(stats.entries <= 10, "entries = {}", stats.entries);
    }

    #[test]
    fn test_stats() {
        let cache = LocalCache::new();
        cache.get_or_create("product", &config(100, 60));
        let ctx = Context::new("product", "1");
        cache.put(&ctx, json!(1));
        cache.get(&ctx);
        cache.get(&Context::new("product", "missing"));

        let stats = cache.stats("product").unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_ratio, 0.5);
        assert!(cache.stats("nope").is_none());
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache = Arc::new(LocalCache::new());
        cache.get_or_create("product", &config(100_000, 60));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let ctx = Context::new("product", format!("{}-{}", t, i));
                        cache.put(&ctx, json!(i));
                        assert!(cache.get(&ctx).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.stats("product").unwrap().entries, 4000);
    }
}
