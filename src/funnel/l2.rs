//! L2 - Noise Filter
//!
//! Per-resource windowed access counters. A key only moves on to hotspot
//! detection once it has been seen `threshold` times inside one window;
//! everything below that is long-tail noise and goes straight to the loader.
//!
//! Counters live in a TTL'd container keyed by cache key. The TTL is the
//! window, measured from the first access, so an expired entry resets the
//! count implicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;
use tracing::{debug, info};

use super::context::{CacheKey, Context};
use crate::rule::L2Config;

/// Upper bound on tracked keys per resource.
pub const MAX_TRACKED_KEYS: u64 = 100_000;

struct ResourceCounters {
    counters: Cache<CacheKey, Arc<AtomicU64>>,
    config: L2Config,
}

impl ResourceCounters {
    fn build(config: &L2Config) -> Self {
        Self {
            counters: Cache::builder()
                .max_capacity(MAX_TRACKED_KEYS)
                .time_to_live(config.window())
                .build(),
            config: config.clone(),
        }
    }
}

/// L2 noise filter registry
#[derive(Default)]
pub struct NoiseFilter {
    resources: DashMap<String, Arc<ResourceCounters>>,
}

impl NoiseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the counter set for `resource` unless one exists.
    pub fn register(&self, resource: &str, config: &L2Config) {
        self.resources
            .entry(resource.to_string())
            .or_insert_with(|| {
                info!(
                    resource,
                    window_secs = config.window_secs,
                    threshold = config.threshold,
                    "Building L2 counters"
                );
                Arc::new(ResourceCounters::build(config))
            });
    }

    /// Replace the counter set; every count starts over.
    pub fn rebuild(&self, resource: &str, config: &L2Config) {
        info!(resource, window_secs = config.window_secs, "Rebuilding L2 counters");
        let fresh = Arc::new(ResourceCounters::build(config));
        if let Some(old) = self.resources.insert(resource.to_string(), fresh) {
            old.counters.invalidate_all();
        }
    }

    /// Swap the config but keep the live counters.
    ///
    /// Only valid when the window is unchanged; a different window needs
    /// [`rebuild`](Self::rebuild).
    pub fn update(&self, resource: &str, config: &L2Config) {
        let existing = self.resources.get(resource).map(|e| e.clone());
        let counters = match existing {
            Some(existing) if existing.config.window_secs == config.window_secs => {
                existing.counters.clone()
            }
            _ => {
                self.rebuild(resource, config);
                return;
            }
        };

        self.resources.insert(
            resource.to_string(),
            Arc::new(ResourceCounters {
                counters,
                config: config.clone(),
            }),
        );
        debug!(resource, threshold = config.threshold, "L2 config updated in place");
    }

    /// Drop the counter set for `resource`.
    pub fn remove(&self, resource: &str) {
        if let Some((_, old)) = self.resources.remove(resource) {
            old.counters.invalidate_all();
            info!(resource, "Removed L2 counters");
        }
    }

    /// Zero every counter of `resource`.
    pub fn reset(&self, resource: &str) {
        if let Some(entry) = self.resources.get(resource) {
            entry.counters.invalidate_all();
            entry.counters.run_pending_tasks();
            info!(resource, "L2 counters reset");
        }
    }

    /// Count this access and decide whether the key is warm enough to
    /// evaluate for hotspot detection.
    ///
    /// Unconfigured resources always pass.
    pub fn should_pass(&self, ctx: &Context) -> bool {
        let Some(entry) = self.resources.get(ctx.resource()).map(|e| e.clone()) else {
            return true;
        };
        if !entry.config.enabled {
            return true;
        }

        let counter = entry
            .counters
            .get_with(ctx.key().clone(), || Arc::new(AtomicU64::new(0)));
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        let passed = count >= entry.config.threshold;

        debug!(
            resource = ctx.resource(),
            key = %ctx.key(),
            count,
            threshold = entry.config.threshold,
            passed,
            "L2 check"
        );
        passed
    }

    /// Current count for a key within its window.
    pub fn count(&self, ctx: &Context) -> u64 {
        self.resources
            .get(ctx.resource())
            .and_then(|entry| entry.counters.get(ctx.key()))
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn contains_resource(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn config(&self, resource: &str) -> Option<L2Config> {
        self.resources.get(resource).map(|e| e.config.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
