//! Funnel Metrics Collection
//!
//! Counters for every funnel decision plus a smoothed backing-store latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Funnel metrics collector
#[derive(Debug, Default)]
pub struct FunnelMetrics {
    // Entry
    requests: AtomicU64,
    bypassed: AtomicU64,

    // L1
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,

    // L2
    l2_passed: AtomicU64,
    l2_filtered: AtomicU64,

    // L3
    l3_hotspots: AtomicU64,
    l3_normal: AtomicU64,

    // L4
    shared_hits: AtomicU64,
    locked_loads: AtomicU64,
    poll_hits: AtomicU64,
    fallback_loads: AtomicU64,
    direct_loads: AtomicU64,
    load_failures: AtomicU64,

    // Promotion
    promotions: AtomicU64,

    // Backing-store latency (microseconds, exponential moving average)
    source_latency_us: AtomicU64,
}

impl FunnelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2(&self, passed: bool) {
        if passed {
            self.l2_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.l2_filtered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_l3(&self, hotspot: bool) {
        if hotspot {
            self.l3_hotspots.fetch_add(1, Ordering::Relaxed);
        } else {
            self.l3_normal.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_shared_hit(&self) {
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_locked_load(&self) {
        self.locked_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_hit(&self) {
        self.poll_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_load(&self) {
        self.fallback_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_load(&self) {
        self.direct_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.source_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .source_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn source_latency(&self) -> Duration {
        Duration::from_micros(self.source_latency_us.load(Ordering::Relaxed))
    }

    /// Loads that reached the backing store by any path.
    pub fn source_loads(&self) -> u64 {
        self.locked_loads.load(Ordering::Relaxed)
            + self.fallback_loads.load(Ordering::Relaxed)
            + self.direct_loads.load(Ordering::Relaxed)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l1_misses = self.l1_misses.load(Ordering::Relaxed);
        let l1_total = l1_hits + l1_misses;

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            l1_hits,
            l1_misses,
            l1_hit_ratio: if l1_total == 0 {
                0.0
            } else {
                l1_hits as f64 / l1_total as f64
            },
            l2_passed: self.l2_passed.load(Ordering::Relaxed),
            l2_filtered: self.l2_filtered.load(Ordering::Relaxed),
            l3_hotspots: self.l3_hotspots.load(Ordering::Relaxed),
            l3_normal: self.l3_normal.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            locked_loads: self.locked_loads.load(Ordering::Relaxed),
            poll_hits: self.poll_hits.load(Ordering::Relaxed),
            fallback_loads: self.fallback_loads.load(Ordering::Relaxed),
            direct_loads: self.direct_loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            source_loads: self.source_loads(),
            promotions: self.promotions.load(Ordering::Relaxed),
            source_latency: self.source_latency(),
        }
    }
}

/// Snapshot of all funnel metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub bypassed: u64,

    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_ratio: f64,

    pub l2_passed: u64,
    pub l2_filtered: u64,

    pub l3_hotspots: u64,
    pub l3_normal: u64,

    pub shared_hits: u64,
    pub locked_loads: u64,
    pub poll_hits: u64,
    pub fallback_loads: u64,
    pub direct_loads: u64,
    pub load_failures: u64,
    pub source_loads: u64,

    pub promotions: u64,
    pub source_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
