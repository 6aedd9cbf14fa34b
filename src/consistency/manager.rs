//! Consistency Manager
//!
//! Write-path invalidation and cross-node cache notifications.
//!
//! # Write path
//!
//! ```text
//! handle_update(ctx)
//!   1. local invalidate + shared delete          (first delete)
//!   2. second delete after delay_ms              (delay queue, else local timer)
//!   3. publish INVALIDATE on the config channel  (other nodes drop their L1 copy)
//! ```
//!
//! # Receiving side
//!
//! One subscriber task per distinct channel. INVALIDATE drops the local copy;
//! PROMOTE writes the carried value (or the shared copy) into the local
//! cache, unless it was published before this node last invalidated the key.
//! Messages this node published itself are skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use moka::sync::Cache;
use once_cell::sync::OnceCell;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::delay::{DelayedDeleteProducer, LocalDelayScheduler};
use crate::domain::events::BroadcastMessage;
use crate::domain::ports::BroadcastBus;
use crate::funnel::{CacheValue, Context, LocalCache, SafeLoader, MAX_TRACKED_KEYS};
use crate::rule::{ConsistencyConfig, DEFAULT_BROADCAST_CHANNEL};

/// Default bound on draining delayed deletes at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How long a key's last invalidation is remembered for rejecting late
/// promotions.
pub const INVALIDATION_HORIZON: Duration = Duration::from_secs(300);

/// Cache consistency coordinator
pub struct ConsistencyManager {
    node_id: String,
    configs: DashMap<String, ConsistencyConfig>,
    local: Arc<LocalCache>,
    loader: Arc<SafeLoader>,
    bus: Option<Arc<dyn BroadcastBus>>,
    default_channel: String,
    producer: Option<DelayedDeleteProducer>,
    scheduler: LocalDelayScheduler,
    shutdown_grace: Duration,
    channels: DashSet<String>,
    /// Last invalidation time per key
    invalidated: Cache<Context, DateTime<Utc>>,
    runtime: OnceCell<Handle>,
    cancel: CancellationToken,
    subscriptions: TaskTracker,
    shutting_down: AtomicBool,
}

impl ConsistencyManager {
    pub fn new(local: Arc<LocalCache>, loader: Arc<SafeLoader>) -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            configs: DashMap::new(),
            local,
            loader,
            bus: None,
            default_channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            producer: None,
            scheduler: LocalDelayScheduler::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            channels: DashSet::new(),
            invalidated: Cache::builder()
                .max_capacity(MAX_TRACKED_KEYS)
                .time_to_live(INVALIDATION_HORIZON)
                .build(),
            runtime: OnceCell::new(),
            cancel: CancellationToken::new(),
            subscriptions: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Publish and receive over `bus`; `default_channel` is always subscribed.
    pub fn with_broadcast(
        mut self,
        bus: Arc<dyn BroadcastBus>,
        default_channel: impl Into<String>,
    ) -> Self {
        self.bus = Some(bus);
        self.default_channel = default_channel.into();
        self
    }

    /// Send second deletes through a delay queue instead of local timers.
    pub fn with_delayed_delete(mut self, producer: DelayedDeleteProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe the default channel and every configured channel.
    ///
    /// Must run inside a tokio runtime. Channels registered later are
    /// subscribed as they appear.
    pub fn start(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            error!("Consistency manager started outside a tokio runtime, broadcast disabled");
            return;
        };
        let _ = self.runtime.set(handle);

        self.ensure_subscribed(&self.default_channel);
        let channels: Vec<String> = self
            .configs
            .iter()
            .filter(|c| c.enable_broadcast || c.enable_promotion_broadcast)
            .map(|c| c.channel.clone())
            .collect();
        for channel in channels {
            self.ensure_subscribed(&channel);
        }
        info!(node_id = %self.node_id, "Consistency manager started");
    }

    /// Stop receiving, refuse new delayed deletes, and drain pending ones
    /// within the grace period. Returns how many delayed deletes were dropped.
    pub async fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("Shutting down consistency manager");

        self.cancel.cancel();
        self.subscriptions.close();
        self.subscriptions.wait().await;
        self.channels.clear();

        let dropped = self.scheduler.shutdown(self.shutdown_grace).await;
        info!(dropped, "Consistency manager stopped");
        dropped
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn register_config(self: &Arc<Self>, resource: &str, config: &ConsistencyConfig) {
        self.configs.insert(resource.to_string(), config.clone());
        debug!(resource, channel = %config.channel, "Consistency config registered");

        if config.enable_broadcast || config.enable_promotion_broadcast {
            self.ensure_subscribed(&config.channel);
        }
    }

    pub fn remove_config(&self, resource: &str) {
        if self.configs.remove(resource).is_some() {
            info!(resource, "Consistency config removed");
        }
    }

    pub fn config(&self, resource: &str) -> Option<ConsistencyConfig> {
        self.configs.get(resource).map(|c| c.clone())
    }

    /// Channels with a live subscriber.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.clone()).collect()
    }

    /// Local delayed deletes not yet run.
    pub fn pending_delayed_deletes(&self) -> usize {
        self.scheduler.pending()
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Invalidate after a write to the backing store.
    pub async fn handle_update(&self, ctx: &Context) {
        let Some(config) = self.config(ctx.resource()) else {
            debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                "No consistency config, invalidating only"
            );
            self.invalidate_cache(ctx).await;
            return;
        };

        info!(resource = ctx.resource(), key = %ctx.key(), "Handling update");
        self.invalidate_cache(ctx).await;

        if config.enable_delayed_delete {
            self.schedule_delayed_delete(ctx, config.delay()).await;
        }
        if config.enable_broadcast {
            let message = BroadcastMessage::invalidate(ctx, Some(self.node_id.clone()));
            self.publish(&config.channel, &message).await;
        }
    }

    /// Drop the local and shared copies of `ctx`.
    pub async fn invalidate_cache(&self, ctx: &Context) {
        self.invalidated.insert(ctx.clone(), Utc::now());
        self.local.invalidate(ctx);
        self.loader.delete_shared(ctx).await;
        debug!(resource = ctx.resource(), key = %ctx.key(), "Cache invalidated");
    }

    /// Tell peers about a newly promoted hotspot.
    pub async fn handle_promotion(&self, ctx: &Context, value: Option<&CacheValue>) {
        let Some(config) = self.config(ctx.resource()) else {
            return;
        };
        if !config.enable_promotion_broadcast {
            return;
        }

        let message = BroadcastMessage::promote(ctx, value.cloned(), Some(self.node_id.clone()));
        self.publish(&config.channel, &message).await;
        info!(resource = ctx.resource(), key = %ctx.key(), "Promotion broadcast");
    }

    async fn schedule_delayed_delete(&self, ctx: &Context, delay: Duration) {
        if let Some(producer) = &self.producer {
            match producer.send(ctx, delay).await {
                Ok(level) => {
                    info!(
                        resource = ctx.resource(),
                        key = %ctx.key(),
                        level = level.level(),
                        "Delayed delete sent to queue"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        resource = ctx.resource(),
                        key = %ctx.key(),
                        error = %e,
                        "Delay queue send failed, using local timer"
                    );
                }
            }
        }

        let local = Arc::clone(&self.local);
        let loader = Arc::clone(&self.loader);
        let invalidated = self.invalidated.clone();
        let target = ctx.clone();
        let scheduled = self.scheduler.schedule(delay, async move {
            invalidated.insert(target.clone(), Utc::now());
            local.invalidate(&target);
            loader.delete_shared(&target).await;
            info!(
                resource = target.resource(),
                key = %target.key(),
                "Delayed delete executed"
            );
        });

        match scheduled {
            Ok(()) => debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                delay_ms = delay.as_millis() as u64,
                "Delayed delete scheduled locally"
            ),
            Err(e) => warn!(
                resource = ctx.resource(),
                key = %ctx.key(),
                error = %e,
                "Delayed delete not scheduled"
            ),
        }
    }

    async fn publish(&self, channel: &str, message: &BroadcastMessage) {
        let Some(bus) = &self.bus else {
            trace!(channel, "No broadcast bus, skipping publish");
            return;
        };

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "Broadcast message not encodable");
                return;
            }
        };
        match bus.publish(channel, payload).await {
            Ok(()) => debug!(channel, kind = message.kind(), "Broadcast published"),
            Err(e) => warn!(channel, kind = message.kind(), error = %e, "Broadcast publish failed"),
        }
    }

    // =========================================================================
    // Receiving Side
    // =========================================================================

    fn ensure_subscribed(self: &Arc<Self>, channel: &str) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let Some(handle) = self.runtime.get() else {
            // start() picks it up
            return;
        };
        if self.shutting_down.load(Ordering::SeqCst) || !self.channels.insert(channel.to_string())
        {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let channel = channel.to_string();
        self.subscriptions.spawn_on(
            async move {
                let mut stream = match bus.subscribe(&channel).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Broadcast subscribe failed");
                        if let Some(manager) = manager.upgrade() {
                            manager.channels.remove(&channel);
                        }
                        return;
                    }
                };
                info!(channel = %channel, "Subscribed to broadcast channel");

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = stream.next() => {
                            let Some(payload) = next else { break };
                            let Some(manager) = manager.upgrade() else { break };
                            manager.handle_message(&payload).await;
                        }
                    }
                }
                info!(channel = %channel, "Unsubscribed from broadcast channel");
            },
            handle,
        );
    }

    /// Apply one broadcast payload to the local cache.
    pub async fn handle_message(&self, payload: &[u8]) {
        let message = match BroadcastMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable broadcast message");
                return;
            }
        };
        if message.origin() == Some(self.node_id.as_str()) {
            trace!(kind = message.kind(), "Skipping own broadcast");
            return;
        }

        let ctx = message.context();
        if self.is_stale_promotion(&ctx, &message) {
            debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                "Dropping promotion published before the last invalidation"
            );
            return;
        }

        match message {
            BroadcastMessage::Invalidate { .. } => {
                self.invalidated.insert(ctx.clone(), Utc::now());
                self.local.invalidate(&ctx);
                debug!(resource = ctx.resource(), key = %ctx.key(), "Remote invalidation applied");
            }
            BroadcastMessage::Promote { value: Some(value), .. } => {
                self.apply_promotion(&ctx, value, "Remote promotion applied");
            }
            BroadcastMessage::Promote { value: None, .. } => {
                match self.loader.read_shared(&ctx).await {
                    Some(value) => {
                        self.apply_promotion(
                            &ctx,
                            value,
                            "Remote promotion applied from shared cache",
                        );
                    }
                    None => warn!(
                        resource = ctx.resource(),
                        key = %ctx.key(),
                        "Promotion received but shared cache is empty"
                    ),
                }
            }
        }
    }

    /// A promotion published at or before this node's last invalidation of
    /// the key carries a value the write already replaced. Unstamped
    /// promotions are accepted.
    fn is_stale_promotion(&self, ctx: &Context, message: &BroadcastMessage) -> bool {
        let Some(published_at) = message.published_at() else {
            return false;
        };
        self.invalidated
            .get(ctx)
            .is_some_and(|invalidated_at| published_at <= invalidated_at)
    }

    fn apply_promotion(&self, ctx: &Context, value: CacheValue, applied: &str) {
        if self.local.put(ctx, value) {
            info!(resource = ctx.resource(), key = %ctx.key(), "{}", applied);
        } else {
            debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                "Promotion received for a resource without a local cache"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        InMemoryBroadcastBus, InMemoryDelayQueue, InMemoryLockService, InMemorySharedCache,
    };
    use crate::domain::ports::SharedCache;
    use crate::funnel::FunnelMetrics;
    use crate::rule::{L1Config, L4Config};
    use bytes::Bytes;
    use serde_json::json;

    struct Node {
        local: Arc<LocalCache>,
        loader: Arc<SafeLoader>,
        manager: Arc<ConsistencyManager>,
    }

    fn node(shared: &Arc<InMemorySharedCache>, bus: &Arc<InMemoryBroadcastBus>) -> Node {
        let local = Arc::new(LocalCache::new());
        local.get_or_create("product", &L1Config::default());
        let loader = Arc::new(SafeLoader::new(
            Arc::clone(shared) as Arc<dyn SharedCache>,
            Arc::new(InMemoryLockService::new()),
            Arc::new(FunnelMetrics::new()),
        ));
        loader.register_config("product", &L4Config::default());
        let manager = Arc::new(
            ConsistencyManager::new(Arc::clone(&local), Arc::clone(&loader))
                .with_broadcast(
                    Arc::clone(bus) as Arc<dyn BroadcastBus>,
                    DEFAULT_BROADCAST_CHANNEL,
                )
                .with_shutdown_grace(Duration::from_millis(50)),
        );
        Node {
            local,
            loader,
            manager,
        }
    }

    fn fast_config() -> ConsistencyConfig {
        ConsistencyConfig {
            delay_ms: 100,
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_update_without_config_only_invalidates() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        n.manager.start();

        let ctx = Context::new("product", "1");
        n.local.put(&ctx, json!(1));
        shared
            .set("hotshield:product:1", Bytes::from_static(b"1"), Duration::from_secs(60))
            .await
            .unwrap();

        n.manager.handle_update(&ctx).await;
        assert_eq!(n.local.get(&ctx), None);
        assert!(n.loader.read_shared(&ctx).await.is_none());
        assert_eq!(bus.published(), 0);
        assert_eq!(n.manager.pending_delayed_deletes(), 0);
    }

    #[tokio::test]
    async fn test_delayed_double_delete() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        n.manager.start();
        n.manager.register_config("product", &fast_config());

        let ctx = Context::new("product", "1");
        n.manager.handle_update(&ctx).await;
        assert_eq!(n.manager.pending_delayed_deletes(), 1);

        // A concurrent reader refills with stale data inside the window
        shared
            .set("hotshield:product:1", Bytes::from_static(b"\"stale\""), Duration::from_secs(60))
            .await
            .unwrap();
        n.local.put(&ctx, json!("stale"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(n.local.get(&ctx), None);
        assert!(n.loader.read_shared(&ctx).await.is_none());
        assert_eq!(n.manager.pending_delayed_deletes(), 0);
    }

    #[tokio::test]
    async fn test_delayed_delete_via_queue() {
        let shared = Arc::new(InMemorySharedCache::new());
        let queue = Arc::new(InMemoryDelayQueue::with_time_divisor(1000));
        let local = Arc::new(LocalCache::new());
        let loader = Arc::new(SafeLoader::new(
            Arc::clone(&shared) as Arc<dyn SharedCache>,
            Arc::new(InMemoryLockService::new()),
            Arc::new(FunnelMetrics::new()),
        ));
        let manager = Arc::new(
            ConsistencyManager::new(local, loader).with_delayed_delete(
                DelayedDeleteProducer::new(queue.clone(), "hotshield-delayed-delete"),
            ),
        );
        manager.register_config("product", &fast_config());

        manager.handle_update(&Context::new("product", "1")).await;
        let sent = queue.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "hotshield-delayed-delete");
        assert_eq!(sent[0].1.level(), 1);
        assert_eq!(manager.pending_delayed_deletes(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_invalidates_peer_not_self() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let a = node(&shared, &bus);
        let b = node(&shared, &bus);
        a.manager.start();
        b.manager.start();
        a.manager.register_config("product", &fast_config());
        b.manager.register_config("product", &fast_config());
        settle().await;

        let ctx = Context::new("product", "1");
        b.local.put(&ctx, json!("peer copy"));

        a.manager.handle_update(&ctx).await;
        settle().await;
        assert_eq!(b.local.get(&ctx), None);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_promotion_with_and_without_value() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let a = node(&shared, &bus);
        let b = node(&shared, &bus);
        a.manager.start();
        b.manager.start();
        a.manager.register_config("product", &fast_config());
        settle().await;

        let hot = Context::new("product", "hot");
        a.manager.handle_promotion(&hot, Some(&json!("v1"))).await;
        settle().await;
        assert_eq!(b.local.get(&hot), Some(json!("v1")));

        // Without a value the peer reads the shared cache
        let warm = Context::new("product", "warm");
        shared
            .set("hotshield:product:warm", Bytes::from_static(b"\"shared\""), Duration::from_secs(60))
            .await
            .unwrap();
        a.manager.handle_promotion(&warm, None).await;
        settle().await;
        assert_eq!(b.local.get(&warm), Some(json!("shared")));

        // Nothing anywhere: logged, no entry
        let cold = Context::new("product", "cold");
        a.manager.handle_promotion(&cold, None).await;
        settle().await;
        assert_eq!(b.local.get(&cold), None);
    }

    #[tokio::test]
    async fn test_promotion_older_than_invalidation_is_dropped() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        let ctx = Context::new("product", "1");

        // Published by a peer before our write, delivered after it
        let late = BroadcastMessage::promote(&ctx, Some(json!("old")), Some("peer".into()));
        n.manager.invalidate_cache(&ctx).await;
        n.manager.handle_message(&late.encode().unwrap()).await;
        assert_eq!(n.local.get(&ctx), None);

        let fresh = BroadcastMessage::Promote {
            resource: "product".into(),
            key: "1".into(),
            value: Some(json!("new")),
            origin: Some("peer".into()),
            published_at: Some(Utc::now() + chrono::Duration::milliseconds(5)),
        };
        n.manager.handle_message(&fresh.encode().unwrap()).await;
        assert_eq!(n.local.get(&ctx), Some(json!("new")));

        // A remote invalidation also fences older promotions
        let other = Context::new("product", "2");
        let late = BroadcastMessage::promote(&other, Some(json!("old")), Some("peer".into()));
        let invalidate = BroadcastMessage::invalidate(&other, Some("writer".into()));
        n.manager.handle_message(&invalidate.encode().unwrap()).await;
        n.manager.handle_message(&late.encode().unwrap()).await;
        assert_eq!(n.local.get(&other), None);
    }

    #[tokio::test]
    async fn test_unstamped_promotion_is_applied() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        let ctx = Context::new("product", "1");

        n.manager.invalidate_cache(&ctx).await;
        n.manager
            .handle_message(br#"{"kind":"PROMOTE","resource":"product","key":"1","value":7}"#)
            .await;
        assert_eq!(n.local.get(&ctx), Some(json!(7)));
    }

    #[tokio::test]
    async fn test_promotion_for_resource_without_local_cache() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        let ctx = Context::new("order", "1");

        let message = BroadcastMessage::promote(&ctx, Some(json!(1)), Some("peer".into()));
        n.manager.handle_message(&message.encode().unwrap()).await;
        assert_eq!(n.local.get(&ctx), None);
        assert!(!n.local.contains_resource("order"));
    }

    #[tokio::test]
    async fn test_promotion_disabled() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let a = node(&shared, &bus);
        a.manager.register_config(
            "product",
            &ConsistencyConfig {
                enable_promotion_broadcast: false,
                ..fast_config()
            },
        );
        a.manager
            .handle_promotion(&Context::new("product", "1"), Some(&json!(1)))
            .await;
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn test_legacy_message_invalidates() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        let ctx = Context::new("product", "1");
        n.local.put(&ctx, json!(1));

        n.manager
            .handle_message(br#"{"resource":"product","key":"1"}"#)
            .await;
        assert_eq!(n.local.get(&ctx), None);
    }

    #[tokio::test]
    async fn test_broadcast_failure_does_not_fail_update() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        bus.set_failing(true);
        let n = node(&shared, &bus);
        n.manager.register_config("product", &fast_config());

        let ctx = Context::new("product", "1");
        n.local.put(&ctx, json!(1));
        n.manager.handle_update(&ctx).await;
        assert_eq!(n.local.get(&ctx), None);
    }

    #[tokio::test]
    async fn test_channels_subscribed_once() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        n.manager.start();
        n.manager.register_config("product", &fast_config());
        n.manager.register_config(
            "user",
            &ConsistencyConfig {
                channel: "users:invalidate".into(),
                ..fast_config()
            },
        );
        settle().await;

        let mut channels = n.manager.subscribed_channels();
        channels.sort();
        assert_eq!(channels, vec!["hotshield:invalidate", "users:invalidate"]);
        assert_eq!(bus.subscriber_count(DEFAULT_BROADCAST_CHANNEL), 1);
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_and_drops_pending() {
        let shared = Arc::new(InMemorySharedCache::new());
        let bus = Arc::new(InMemoryBroadcastBus::new());
        let n = node(&shared, &bus);
        n.manager.start();
        n.manager.register_config(
            "product",
            &ConsistencyConfig {
                delay_ms: 60_000,
                ..Default::default()
            },
        );
        settle().await;

        n.manager.handle_update(&Context::new("product", "1")).await;
        n.manager.handle_update(&Context::new("product", "2")).await;

        let dropped = n.manager.shutdown().await;
        assert_eq!(dropped, 2);
        assert_eq!(bus.subscriber_count(DEFAULT_BROADCAST_CHANNEL), 0);
        assert!(n.manager.subscribed_channels().is_empty());

        // After shutdown new delayed deletes are refused but the first delete still runs
        let ctx = Context::new("product", "3");
        n.local.put(&ctx, json!(3));
        n.manager.handle_update(&ctx).await;
        assert_eq!(n.local.get(&ctx), None);
        assert_eq!(n.manager.pending_delayed_deletes(), 0);
    }
}
