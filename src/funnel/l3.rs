//! L3 - Hotspot Detector
//!
//! Per-key flow check. Each key gets a fixed window of `window_secs`; the
//! window admits `qps_threshold * window_secs` requests and every request
//! beyond that marks the key as a hotspot until the window rolls over.
//!
//! Rule changes are always applied in place: live windows are kept and are
//! judged against the new threshold from the next request on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::context::{CacheKey, Context};
use crate::rule::L3Config;

/// Upper bound on tracked keys per resource.
const MAX_TRACKED_KEYS: u64 = 100_000;

/// Idle windows are dropped after this long.
const WINDOW_IDLE: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct KeyWindow {
    started: Instant,
    count: u64,
}

impl KeyWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }
}

struct ResourceDetector {
    config: RwLock<L3Config>,
    windows: Cache<CacheKey, Arc<Mutex<KeyWindow>>>,
}

impl ResourceDetector {
    fn new(config: &L3Config) -> Self {
        Self {
            config: RwLock::new(config.clone()),
            windows: Cache::builder()
                .max_capacity(MAX_TRACKED_KEYS)
                .time_to_idle(WINDOW_IDLE)
                .build(),
        }
    }
}

/// Slack absorbing float error in `qps * window` before flooring.
const ALLOWANCE_EPSILON: f64 = 1e-9;

/// Requests one window admits before the key counts as hot.
fn allowed_per_window(config: &L3Config) -> u64 {
    (config.qps_threshold * config.window_secs as f64 + ALLOWANCE_EPSILON).floor() as u64
}

/// L3 hotspot detector registry
#[derive(Default)]
pub struct HotspotDetector {
    resources: DashMap<String, Arc<ResourceDetector>>,
}

impl HotspotDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the flow rule for `resource`, keeping live windows.
    pub fn update_rule(&self, resource: &str, config: &L3Config) {
        let existing = self.resources.get(resource).map(|e| e.clone());
        match existing {
            Some(detector) => {
                *detector.config.write() = config.clone();
                info!(
                    resource,
                    qps_threshold = config.qps_threshold,
                    window_secs = config.window_secs,
                    "L3 rule updated"
                );
            }
            None => {
                self.resources
                    .insert(resource.to_string(), Arc::new(ResourceDetector::new(config)));
                info!(
                    resource,
                    qps_threshold = config.qps_threshold,
                    window_secs = config.window_secs,
                    "L3 rule registered"
                );
            }
        }
    }

    /// Drop the flow rule and every window for `resource`.
    pub fn remove_rule(&self, resource: &str) {
        if let Some((_, detector)) = self.resources.remove(resource) {
            detector.windows.invalidate_all();
            info!(resource, "L3 rule removed");
        }
    }

    /// Count this request and report whether the key is over its threshold.
    ///
    /// Resources without a rule are never hot.
    pub fn is_hotspot(&self, ctx: &Context) -> bool {
        let Some(detector) = self.resources.get(ctx.resource()).map(|e| e.clone()) else {
            return false;
        };

        let config = detector.config.read().clone();
        if !config.enabled {
            return false;
        }
        let window_len = Duration::from_secs(config.window_secs);
        let allowed = allowed_per_window(&config);

        let window = detector
            .windows
            .get_with(ctx.key().clone(), || Arc::new(Mutex::new(KeyWindow::new())));

        let count = {
            let mut window = window.lock();
            if window.started.elapsed() >= window_len {
                *window = KeyWindow::new();
            }
            window.count += 1;
            window.count
        };

        let hotspot = count > allowed;
        if hotspot {
            debug!(
                resource = ctx.resource(),
                key = %ctx.key(),
                count,
                allowed,
                "L3 hotspot"
            );
        }
        hotspot
    }

    /// Observed request rate of a key in its current window.
    pub fn current_qps(&self, ctx: &Context) -> f64 {
        let Some(detector) = self.resources.get(ctx.resource()).map(|e| e.clone()) else {
            return 0.0;
        };
        let window_secs = detector.config.read().window_secs.max(1);
        let Some(window) = detector.windows.get(ctx.key()) else {
            return 0.0;
        };

        let window = window.lock();
        if window.started.elapsed() >= Duration::from_secs(window_secs) {
            0.0
        } else {
            window.count as f64 / window_secs as f64
        }
    }

    pub fn contains_resource(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn config(&self, resource: &str) -> Option<L3Config> {
        self.resources.get(resource).map(|d| d.config.read().clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
