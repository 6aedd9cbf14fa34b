//! L4 - Safe Loader
//!
//! Load-through in front of the backing store, sharing results between
//! processes through the shared cache.
//!
//! ```text
//! shared get ──hit──────────────────────────────────────────► value
//!     │ miss
//!     ▼
//! try_lock(lock:<shared key>, wait, lease)
//!     ├─ acquired ─► shared get (double check) ─miss─► load ─► set(ttl) ─► unlock
//!     └─ not acquired ─► poll shared get (100ms, x2, <=500ms, 5 tries)
//!                            └─ all miss ─► load ─► set(60s)
//! ```
//!
//! Shared-cache failures degrade to a miss. Loader failures are classified
//! and returned to the caller; nothing is cached for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::context::{CacheValue, Context};
use super::metrics::{FunnelMetrics, LatencyTracker};
use crate::domain::ports::{LockService, LockToken, SharedCache};
use crate::error::{Error, LoadFailureReason, Result};
use crate::rule::{L4Config, DEFAULT_KEY_PREFIX};

/// TTL for values written after a lock-wait fallback.
pub const FALLBACK_TTL: Duration = Duration::from_secs(60);

/// Poll attempts after losing the lock race.
pub const POLL_ATTEMPTS: u32 = 5;

const POLL_INITIAL_DELAY: Duration = Duration::from_millis(100);
const POLL_MAX_DELAY: Duration = Duration::from_millis(500);

/// Prefix of every lock key.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// L4 safe loader
pub struct SafeLoader {
    shared: Arc<dyn SharedCache>,
    lock: Arc<dyn LockService>,
    configs: DashMap<String, L4Config>,
    /// Key prefixes of removed configs, so leftover shared entries can
    /// still be invalidated
    retired_prefixes: DashMap<String, String>,
    metrics: Arc<FunnelMetrics>,
}

impl SafeLoader {
    pub fn new(
        shared: Arc<dyn SharedCache>,
        lock: Arc<dyn LockService>,
        metrics: Arc<FunnelMetrics>,
    ) -> Self {
        Self {
            shared,
            lock,
            configs: DashMap::new(),
            retired_prefixes: DashMap::new(),
            metrics,
        }
    }

    pub fn register_config(&self, resource: &str, config: &L4Config) {
        self.configs.insert(resource.to_string(), config.clone());
        self.retired_prefixes.remove(resource);
        debug!(resource, key_prefix = %config.key_prefix, "L4 config registered");
    }

    pub fn remove_config(&self, resource: &str) {
        if let Some((_, config)) = self.configs.remove(resource) {
            self.retired_prefixes
                .insert(resource.to_string(), config.key_prefix);
            info!(resource, "L4 config removed");
        }
    }

    pub fn config(&self, resource: &str) -> Option<L4Config> {
        self.configs.get(resource).map(|c| c.clone())
    }

    /// `<keyPrefix><resource>:<key>`. A removed config keeps its prefix;
    /// resources never configured use the default.
    pub fn shared_key(&self, ctx: &Context) -> String {
        let prefix = self
            .configs
            .get(ctx.resource())
            .map(|c| c.key_prefix.clone())
            .or_else(|| self.retired_prefixes.get(ctx.resource()).map(|p| p.clone()))
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        format!("{}{}:{}", prefix, ctx.resource(), ctx.key())
    }

    pub fn lock_key(shared_key: &str) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, shared_key)
    }

    /// Load `ctx` through the shared cache, calling `loader` at most once.
    ///
    /// Resources without an L4 config call the loader directly.
    pub async fn load<F, Fut>(&self, ctx: &Context, loader: F) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        let Some(config) = self.config(ctx.resource()) else {
            debug!(resource = ctx.resource(), "No L4 config, loading directly");
            return self.load_direct(ctx, loader).await;
        };

        let shared_key = self.shared_key(ctx);
        if let Some(value) = self.read(&shared_key).await {
            debug!(resource = ctx.resource(), key = %ctx.key(), "Shared cache hit");
            self.metrics.record_shared_hit();
            return Ok(Some(value));
        }

        let lock_key = Self::lock_key(&shared_key);
        match self.acquire(&lock_key, &config).await {
            Some(token) => {
                let result = self
                    .load_locked(ctx, &shared_key, &config, loader)
                    .await;
                self.release(&token).await;
                result
            }
            None => {
                if let Some(value) = self.poll(ctx, &shared_key).await {
                    self.metrics.record_poll_hit();
                    return Ok(Some(value));
                }

                warn!(
                    resource = ctx.resource(),
                    key = %ctx.key(),
                    "Lock not acquired and shared cache still empty, loading directly"
                );
                self.metrics.record_fallback_load();
                let value = self.invoke(ctx, loader).await?;
                if let Some(v) = &value {
                    self.write(&shared_key, v, FALLBACK_TTL).await;
                }
                Ok(value)
            }
        }
    }

    /// Call the loader with no shared-cache involvement.
    pub async fn load_direct<F, Fut>(&self, ctx: &Context, loader: F) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        self.metrics.record_direct_load();
        self.invoke(ctx, loader).await
    }

    async fn load_locked<F, Fut>(
        &self,
        ctx: &Context,
        shared_key: &str,
        config: &L4Config,
        loader: F,
    ) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        if let Some(value) = self.read(shared_key).await {
            debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                "Shared cache filled while waiting for lock"
            );
            self.metrics.record_shared_hit();
            return Ok(Some(value));
        }

        self.metrics.record_locked_load();
        let value = self.invoke(ctx, loader).await?;
        if let Some(v) = &value {
            self.write(shared_key, v, config.shared_ttl()).await;
        }
        Ok(value)
    }

    async fn poll(&self, ctx: &Context, shared_key: &str) -> Option<CacheValue> {
        let mut delay = POLL_INITIAL_DELAY;
        for attempt in 1..=POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            if let Some(value) = self.read(shared_key).await {
                debug!(
                    resource = ctx.resource(),
                    key = %ctx.key(),
                    attempt,
                    "Shared cache filled by lock holder"
                );
                return Some(value);
            }
            delay = (delay * 2).min(POLL_MAX_DELAY);
        }
        None
    }

    /// Run the loader, timing it and classifying any failure.
    async fn invoke<F, Fut>(&self, ctx: &Context, loader: F) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        let tracker = LatencyTracker::start();
        let result = loader().await;
        self.metrics.record_source_latency(tracker.elapsed());

        result.map_err(|source| {
            self.metrics.record_load_failure();
            let reason = LoadFailureReason::classify(&source);
            log_load_failure(ctx, reason, &source);
            Error::Load {
                resource: ctx.resource().to_string(),
                key: ctx.key().to_string(),
                reason,
                source,
            }
        })
    }

    async fn acquire(&self, lock_key: &str, config: &L4Config) -> Option<LockToken> {
        match self
            .lock
            .try_lock(lock_key, config.lock_wait(), config.lock_lease())
            .await
        {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                debug!(lock_key, "Lock wait elapsed");
                None
            }
            Err(e) => {
                warn!(lock_key, error = %e, "Lock acquire failed");
                None
            }
        }
    }

    async fn release(&self, token: &LockToken) {
        if let Err(e) = self.lock.unlock(token).await {
            warn!(lock_key = %token.key, error = %e, "Lock release failed, lease will expire");
        }
    }

    /// Read the shared copy of `ctx`; failures count as a miss.
    pub async fn read_shared(&self, ctx: &Context) -> Option<CacheValue> {
        self.read(&self.shared_key(ctx)).await
    }

    /// Delete the shared copy of `ctx`; failures are logged.
    pub async fn delete_shared(&self, ctx: &Context) {
        let shared_key = self.shared_key(ctx);
        match self.shared.delete(&shared_key).await {
            Ok(()) => debug!(shared_key = %shared_key, "Shared cache entry deleted"),
            Err(e) => warn!(shared_key = %shared_key, error = %e, "Shared cache delete failed"),
        }
    }

    async fn read(&self, shared_key: &str) -> Option<CacheValue> {
        match self.shared.get(shared_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(shared_key, error = %e, "Undecodable shared cache entry, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(shared_key, error = %e, "Shared cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write(&self, shared_key: &str, value: &CacheValue, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(shared_key, error = %e, "Value not encodable, skipping shared cache write");
                return;
            }
        };
        if let Err(e) = self.shared.set(shared_key, bytes, ttl).await {
            warn!(shared_key, error = %e, "Shared cache write failed");
        }
    }
}

fn log_load_failure(ctx: &Context, reason: LoadFailureReason, source: &anyhow::Error) {
    let resource = ctx.resource();
    let key = ctx.key();
    match reason {
        LoadFailureReason::BackingStore => {
            error!(resource, key = %key, error = %source, "Backing store load failed")
        }
        LoadFailureReason::Timeout => {
            error!(resource, key = %key, error = %source, "Backing store load timed out")
        }
        LoadFailureReason::SharedCache => {
            warn!(resource, key = %key, error = %source, "Load failed on shared cache access")
        }
        LoadFailureReason::Lock => {
            warn!(resource, key = %key, error = %source, "Load failed on lock access")
        }
        LoadFailureReason::Unknown => {
            error!(resource, key = %key, error = ?source, "Load failed")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryLockService, InMemorySharedCache};
    use crate::error::SourceError;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loader_with(shared: Arc<InMemorySharedCache>) -> (SafeLoader, Arc<FunnelMetrics>) {
        let metrics = Arc::new(FunnelMetrics::new());
        let loader = SafeLoader::new(
            shared,
            Arc::new(InMemoryLockService::new()),
            Arc::clone(&metrics),
        );
        (loader, metrics)
    }

    #[test]
    fn test_key_layout() {
        let (loader, _) = loader_with(Arc::new(InMemorySharedCache::new()));
        let ctx = Context::new("product", "42");
        assert_eq!(loader.shared_key(&ctx), "hotshield:product:42");

        loader.register_config(
            "product",
            &L4Config {
                key_prefix: "shop:".into(),
                ..Default::default()
            },
        );
        let shared_key = loader.shared_key(&ctx);
        assert_eq!(shared_key, "shop:product:42");
        assert_eq!(SafeLoader::lock_key(&shared_key), "lock:shop:product:42");

        // Removal keeps addressing entries written under the old prefix
        loader.remove_config("product");
        assert_eq!(loader.shared_key(&ctx), "shop:product:42");

        loader.register_config("product", &L4Config::default());
        assert_eq!(loader.shared_key(&ctx), "hotshield:product:42");
    }

    #[tokio::test]
    async fn test_unconfigured_loads_directly_without_caching() {
        let shared = Arc::new(InMemorySharedCache::new());
        let (loader, metrics) = loader_with(Arc::clone(&shared));
        let ctx = Context::new("product", "1");

        let value = loader.load(&ctx, || async { Ok(Some(json!("v"))) }).await.unwrap();
        assert_eq!(value, Some(json!("v")));
        assert!(shared.is_empty());
        assert_eq!(metrics.snapshot().direct_loads, 1);
    }

    #[tokio::test]
    async fn test_miss_loads_and_fills_shared_cache() {
        let shared = Arc::new(InMemorySharedCache::new());
        let (loader, metrics) = loader_with(Arc::clone(&shared));
        loader.register_config("product", &L4Config::default());
        let ctx = Context::new("product", "1");

        let value = loader.load(&ctx, || async { Ok(Some(json!({"id": 1}))) }).await.unwrap();
        assert_eq!(value, Some(json!({"id": 1})));
        assert_eq!(loader.read_shared(&ctx).await, Some(json!({"id": 1})));
        assert_eq!(
            shared.ttl_of("hotshield:product:1"),
            Some(Duration::from_secs(300))
        );

        // Second call is served by the shared cache
        let value = loader
            .load(&ctx, || async { Err(anyhow::anyhow!("loader must not run")) })
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"id": 1})));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.locked_loads, 1);
        assert_eq!(snapshot.shared_hits, 1);
    }

    #[tokio::test]
    async fn test_none_is_not_cached() {
        let shared = Arc::new(InMemorySharedCache::new());
        let (loader, _) = loader_with(Arc::clone(&shared));
        loader.register_config("product", &L4Config::default());

        let value = loader
            .load(&Context::new("product", "1"), || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn test_loader_error_is_classified_and_not_cached() {
        let shared = Arc::new(InMemorySharedCache::new());
        let (loader, metrics) = loader_with(Arc::clone(&shared));
        loader.register_config("product", &L4Config::default());

        let result = loader
            .load(&Context::new("product", "1"), || async {
                Err(anyhow::Error::new(SourceError::new("connection refused")))
            })
            .await;
        assert_matches!(
            result,
            Err(Error::Load {
                reason: LoadFailureReason::BackingStore,
                ..
            })
        );
        assert!(shared.is_empty());
        assert_eq!(metrics.snapshot().load_failures, 1);
    }

    #[tokio::test]
    async fn test_shared_cache_failure_degrades_to_load() {
        let shared = Arc::new(InMemorySharedCache::new());
        shared.set_failing(true);
        let (loader, _) = loader_with(Arc::clone(&shared));
        loader.register_config("product", &L4Config::default());

        let value = loader
            .load(&Context::new("product", "1"), || async { Ok(Some(json!(1))) })
            .await
            .unwrap();
        assert_eq!(value, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let shared = Arc::new(InMemorySharedCache::new());
        let (loader, _) = loader_with(Arc::clone(&shared));
        loader.register_config("product", &L4Config::default());
        let loader = Arc::new(loader);
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let loader = Arc::clone(&loader);
                let loads = Arc::clone(&loads);
                tokio::spawn(async move {
                    loader
                        .load(&Context::new("product", "hot"), || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Some(json!("db")))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Some(json!("db")));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_falls_back_with_short_ttl() {
        let shared = Arc::new(InMemorySharedCache::new());
        let lock = Arc::new(InMemoryLockService::new());
        let metrics = Arc::new(FunnelMetrics::new());
        let loader = SafeLoader::new(
            Arc::clone(&shared) as Arc<dyn SharedCache>,
            Arc::clone(&lock) as Arc<dyn LockService>,
            Arc::clone(&metrics),
        );
        loader.register_config(
            "product",
            &L4Config {
                lock_wait_ms: 10,
                ..Default::default()
            },
        );
        let ctx = Context::new("product", "1");

        // Someone else holds the lock and never fills the cache
        let held = lock
            .try_lock(
                "lock:hotshield:product:1",
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap()
            .unwrap();

        let value = loader.load(&ctx, || async { Ok(Some(json!("fallback"))) }).await.unwrap();
        assert_eq!(value, Some(json!("fallback")));
        assert_eq!(shared.ttl_of("hotshield:product:1"), Some(FALLBACK_TTL));
        assert_eq!(metrics.snapshot().fallback_loads, 1);

        lock.unlock(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_lock_timeouts_all_get_a_value() {
        const CALLERS: usize = 8;
        let shared = Arc::new(InMemorySharedCache::new());
        let lock = Arc::new(InMemoryLockService::new());
        let metrics = Arc::new(FunnelMetrics::new());
        let loader = Arc::new(SafeLoader::new(
            Arc::clone(&shared) as Arc<dyn SharedCache>,
            Arc::clone(&lock) as Arc<dyn LockService>,
            Arc::clone(&metrics),
        ));
        loader.register_config(
            "product",
            &L4Config {
                lock_wait_ms: 10,
                ..Default::default()
            },
        );

        // Held by a foreign token for the whole test; the holder never writes
        let held = lock
            .try_lock(
                "lock:hotshield:product:1",
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap()
            .unwrap();

        let loads = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..CALLERS)
            .map(|_| {
                let loader = Arc::clone(&loader);
                let loads = Arc::clone(&loads);
                tokio::spawn(async move {
                    loader
                        .load(&Context::new("product", "1"), || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            Ok(Some(json!("fallback")))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Some(json!("fallback")));
        }

        let loads = loads.load(Ordering::SeqCst);
        assert!(loads >= 1 && loads <= CALLERS, "loads = {}", loads);
        assert_eq!(metrics.snapshot().fallback_loads, loads as u64);
        assert_eq!(shared.ttl_of("hotshield:product:1"), Some(FALLBACK_TTL));
        assert!(lock.is_locked("lock:hotshield:product:1"));

        lock.unlock(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_picks_up_lock_holder_write() {
        let shared = Arc::new(InMemorySharedCache::new());
        let lock = Arc::new(InMemoryLockService::new());
        let metrics = Arc::new(FunnelMetrics::new());
        let loader = SafeLoader::new(
            Arc::clone(&shared) as Arc<dyn SharedCache>,
            Arc::clone(&lock) as Arc<dyn LockService>,
            Arc::clone(&metrics),
        );
        loader.register_config(
            "product",
            &L4Config {
                lock_wait_ms: 10,
                ..Default::default()
            },
        );

        let _held = lock
            .try_lock(
                "lock:hotshield:product:1",
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap()
            .unwrap();

        let writer = Arc::clone(&shared);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            writer
                .set(
                    "hotshield:product:1",
                    Bytes::from_static(b"\"from-holder\""),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        });

        let value = loader
            .load(&Context::new("product", "1"), || async {
                Err(anyhow::anyhow!("loader must not run"))
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!("from-holder")));
        assert_eq!(metrics.snapshot().poll_hits, 1);
    }
}
