//! HotShield facade
//!
//! Wires the tiers, the consistency manager, the rule manager and a rule
//! source over injected ports, and owns their lifecycle.
//!
//! ```ignore
//! let shield = HotShield::builder()
//!     .shared_cache(redis_cache)
//!     .lock_service(redis_locks)
//!     .broadcast_bus(redis_pubsub)
//!     .settings(Settings::from_file("hotshield.yaml")?)
//!     .build()?;
//! shield.start().await?;
//!
//! let value = shield.handle_cache(&Context::new("product", 42u64), || load(42)).await?;
//!
//! shield.shutdown().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::consistency::{ConsistencyManager, DelayedDeleteConsumer, DelayedDeleteProducer};
use crate::domain::{BroadcastBus, DelayQueue, LockService, SharedCache};
use crate::error::{Error, Result};
use crate::funnel::{
    CacheValue, Context, EvictTiming, Funnel, FunnelMetrics, HotspotDetector, L1Stats,
    LocalCache, MetricsSnapshot, NoiseFilter, SafeLoader,
};
use crate::rule::{
    ConfigSource, RuleChangeListener, RuleManager, RulesCallback, StaticConfigSource,
};

/// Builder for [`HotShield`]. The shared cache and lock service are required.
#[derive(Default)]
pub struct HotShieldBuilder {
    settings: Settings,
    shared_cache: Option<Arc<dyn SharedCache>>,
    lock: Option<Arc<dyn LockService>>,
    bus: Option<Arc<dyn BroadcastBus>>,
    delay_queue: Option<Arc<dyn DelayQueue>>,
    source: Option<Arc<dyn ConfigSource>>,
    listeners: Vec<Arc<dyn RuleChangeListener>>,
}

impl HotShieldBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn lock_service(mut self, lock: Arc<dyn LockService>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Enables cross-node invalidation and promotion.
    pub fn broadcast_bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sends second deletes through a durable queue instead of local timers.
    pub fn delay_queue(mut self, queue: Arc<dyn DelayQueue>) -> Self {
        self.delay_queue = Some(queue);
        self
    }

    /// Where rules come from. Defaults to the rules in the settings.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RuleChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<HotShield> {
        let shared_cache = self
            .shared_cache
            .ok_or_else(|| Error::Config("a shared cache is required".into()))?;
        let lock = self
            .lock
            .ok_or_else(|| Error::Config("a lock service is required".into()))?;
        let settings = self.settings;
        let node_id = settings.node_id();

        let metrics = Arc::new(FunnelMetrics::new());
        let local = Arc::new(LocalCache::new());
        let noise = Arc::new(NoiseFilter::new());
        let detector = Arc::new(HotspotDetector::new());
        let loader = Arc::new(SafeLoader::new(shared_cache, lock, Arc::clone(&metrics)));

        let mut consistency = ConsistencyManager::new(Arc::clone(&local), Arc::clone(&loader))
            .with_node_id(node_id.clone())
            .with_shutdown_grace(settings.shutdown_grace());
        if let Some(bus) = self.bus {
            consistency = consistency.with_broadcast(bus, settings.broadcast_channel.clone());
        }
        if let Some(queue) = &self.delay_queue {
            consistency = consistency.with_delayed_delete(DelayedDeleteProducer::new(
                Arc::clone(queue),
                settings.delayed_delete_topic.clone(),
            ));
        }
        let consistency = Arc::new(consistency);

        let funnel = Arc::new(Funnel::new(
            Arc::clone(&local),
            Arc::clone(&noise),
            Arc::clone(&detector),
            Arc::clone(&loader),
            Arc::clone(&consistency),
            metrics,
        ));
        funnel.set_enabled(settings.enabled);

        let rules = Arc::new(RuleManager::new(
            Arc::clone(&local),
            noise,
            detector,
            loader,
            Arc::clone(&consistency),
        ));
        for listener in self.listeners {
            rules.add_listener(listener);
        }

        let source = self
            .source
            .unwrap_or_else(|| Arc::new(StaticConfigSource::new(settings.rules.clone())));

        info!(node_id = %node_id, source = source.kind(), "HotShield built");
        Ok(HotShield {
            settings,
            local,
            consistency,
            funnel,
            rules,
            source,
            delay_queue: self.delay_queue,
            consumer: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

/// One node's hotspot protection.
pub struct HotShield {
    settings: Settings,
    local: Arc<LocalCache>,
    consistency: Arc<ConsistencyManager>,
    funnel: Arc<Funnel>,
    rules: Arc<RuleManager>,
    source: Arc<dyn ConfigSource>,
    delay_queue: Option<Arc<dyn DelayQueue>>,
    consumer: Mutex<Option<Arc<DelayedDeleteConsumer>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl HotShield {
    pub fn builder() -> HotShieldBuilder {
        HotShieldBuilder::default()
    }

    /// Subscribe broadcast channels and the delayed-delete topic, then load
    /// rules from the config source. Later calls do nothing.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node_id = self.consistency.node_id(), "Starting HotShield");

        self.consistency.start();

        if let Some(queue) = &self.delay_queue {
            let consumer = DelayedDeleteConsumer::start(
                Arc::clone(queue),
                &self.settings.delayed_delete_topic,
                Arc::clone(&self.consistency),
            )
            .await?;
            *self.consumer.lock() = Some(Arc::new(consumer));
        }

        let rules = Arc::clone(&self.rules);
        let callback: RulesCallback = Arc::new(move |incoming| {
            rules.update_rules(incoming);
        });
        self.source.subscribe(callback).await?;

        info!(
            rules = self.rules.len(),
            enabled = self.funnel.is_enabled(),
            "HotShield started"
        );
        Ok(())
    }

    /// Stop the rule source and consumers, drain delayed deletes within the
    /// grace period, and clear every rule. Returns how many delayed deletes
    /// were dropped.
    pub async fn shutdown(&self) -> usize {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("Shutting down HotShield");

        self.source.shutdown().await;
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }
        let dropped = self.consistency.shutdown().await;
        if dropped > 0 {
            warn!(dropped, "Delayed deletes dropped at shutdown");
        }
        self.rules.shutdown();

        info!("HotShield stopped");
        dropped
    }

    /// Read through the funnel.
    pub async fn handle_cache<F, Fut>(&self, ctx: &Context, loader: F) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        self.funnel.handle_cache(ctx, loader).await
    }

    /// Run a write and evict its key.
    pub async fn handle_evict<F, Fut, T, E>(
        &self,
        ctx: &Context,
        timing: EvictTiming,
        delayed_delete: bool,
        broadcast: bool,
        write: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.funnel
            .handle_evict(ctx, timing, delayed_delete, broadcast, write)
            .await
    }

    /// Full write-path invalidation for `ctx` as configured for its resource.
    pub async fn handle_update(&self, ctx: &Context) {
        self.consistency.handle_update(ctx).await
    }

    /// Shared funnel, for building [`Cached`](crate::funnel::Cached) and
    /// [`Evicted`](crate::funnel::Evicted) wrappers.
    pub fn funnel(&self) -> Arc<Funnel> {
        Arc::clone(&self.funnel)
    }

    pub fn rule_manager(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.funnel.metrics()
    }

    pub fn l1_stats(&self, resource: &str) -> Option<L1Stats> {
        self.local.stats(resource)
    }

    pub fn node_id(&self) -> &str {
        self.consistency.node_id()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
