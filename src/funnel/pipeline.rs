//! Funnel Pipeline
//!
//! The read path through the four tiers, and the write path that wraps a
//! backing-store write with cache eviction.
//!
//! ```text
//! handle_cache(ctx, loader)
//!   L1 hit ───────────────────────────────────────────────► value
//!   L2 cold ──────────────────────────► L4 load ──────────► value
//!   L2 pass ─► L3 normal ─────────────► L4 load ──────────► value
//!              L3 hotspot ────────────► L4 load ─► promote ► value
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::context::{CacheValue, Context};
use super::l1::LocalCache;
use super::l2::NoiseFilter;
use super::l3::HotspotDetector;
use super::l4::SafeLoader;
use super::metrics::{FunnelMetrics, MetricsSnapshot};
use crate::consistency::ConsistencyManager;
use crate::error::Result;

/// When an eviction runs relative to the wrapped write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictTiming {
    Before,
    #[default]
    After,
}

/// Read and write entry points over all tiers.
pub struct Funnel {
    local: Arc<LocalCache>,
    noise: Arc<NoiseFilter>,
    detector: Arc<HotspotDetector>,
    loader: Arc<SafeLoader>,
    consistency: Arc<ConsistencyManager>,
    metrics: Arc<FunnelMetrics>,
    enabled: AtomicBool,
}

impl Funnel {
    pub fn new(
        local: Arc<LocalCache>,
        noise: Arc<NoiseFilter>,
        detector: Arc<HotspotDetector>,
        loader: Arc<SafeLoader>,
        consistency: Arc<ConsistencyManager>,
        metrics: Arc<FunnelMetrics>,
    ) -> Self {
        Self {
            local,
            noise,
            detector,
            loader,
            consistency,
            metrics,
            enabled: AtomicBool::new(true),
        }
    }

    /// A disabled funnel calls every loader directly.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Funnel toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Read `ctx` through L1 → L2 → L3 → L4.
    ///
    /// Invalid contexts and a disabled funnel skip every tier. Only loader
    /// failures reach the caller.
    pub async fn handle_cache<F, Fut>(&self, ctx: &Context, loader: F) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<CacheValue>>>,
    {
        self.metrics.record_request();
        if !self.is_enabled() || !ctx.is_valid() {
            debug!(context = %ctx, "Bypassing funnel");
            self.metrics.record_bypass();
            return self.loader.load_direct(ctx, loader).await;
        }

        // L1
        if let Some(value) = self.local.get(ctx) {
            self.metrics.record_l1_hit();
            return Ok(Some(value));
        }
        self.metrics.record_l1_miss();

        // L2, then L3 only for keys that made it through
        let passed = self.noise.should_pass(ctx);
        self.metrics.record_l2(passed);
        let promote = if passed {
            let hotspot = self.detector.is_hotspot(ctx);
            self.metrics.record_l3(hotspot);
            hotspot
        } else {
            debug!(resource = ctx.resource(), key = %ctx.key(), "Cold key, skipping hotspot check");
            false
        };

        // L4
        let value = self.loader.load(ctx, loader).await?;

        if promote {
            if let Some(v) = &value {
                self.promote(ctx, v).await;
            }
        }
        Ok(value)
    }

    async fn promote(&self, ctx: &Context, value: &CacheValue) {
        if self.local.put(ctx, value.clone()) {
            self.metrics.record_promotion();
            info!(resource = ctx.resource(), key = %ctx.key(), "Hotspot promoted to L1");
        }
        self.consistency.handle_promotion(ctx, Some(value)).await;
    }

    /// Run `write` and evict `ctx` before or after it.
    ///
    /// With either flag set the eviction goes through the full update path
    /// (delayed delete and broadcast as configured for the resource);
    /// otherwise only the local and shared copies are dropped. With
    /// [`EvictTiming::After`] nothing is evicted when the write fails. The
    /// write's own error is returned unchanged.
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
        if !ctx.is_valid() {
            return write().await;
        }

        if timing == EvictTiming::Before {
            self.evict(ctx, delayed_delete, broadcast).await;
            return write().await;
        }

        let result = write().await;
        if result.is_ok() {
            self.evict(ctx, delayed_delete, broadcast).await;
        }
        result
    }

    async fn evict(&self, ctx: &Context, delayed_delete: bool, broadcast: bool) {
        if delayed_delete || broadcast {
            self.consistency.handle_update(ctx).await;
        } else {
            self.consistency.invalidate_cache(ctx).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
