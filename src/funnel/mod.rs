//! The four-level read funnel
//!
//! ```text
//! request → L1 LocalCache → L2 NoiseFilter → L3 HotspotDetector → L4 SafeLoader → backing store
//!              ▲                                                        │
//!              └──────────────── promotion of hot keys ─────────────────┘
//! ```
//!
//! - [`LocalCache`]: per-resource bounded in-process caches
//! - [`NoiseFilter`]: drops keys seen too rarely to be worth tracking
//! - [`HotspotDetector`]: per-key request rate against a QPS threshold
//! - [`SafeLoader`]: shared cache plus a distributed lock around the loader
//! - [`Funnel`]: the pipeline tying them together, and the write-path entry
//! - [`Cached`] / [`Evicted`]: function wrappers over the pipeline

mod context;
mod decorator;
mod l1;
mod l2;
mod l3;
mod l4;
mod metrics;
mod pipeline;

pub use context::{CacheKey, CacheValue, Context};
pub use decorator::{Cached, Evicted, KeyExtractor};
pub use l1::{L1Stats, LocalCache, ResourceCache};
pub use l2::{NoiseFilter, MAX_TRACKED_KEYS};
pub use l3::HotspotDetector;
pub use l4::{SafeLoader, FALLBACK_TTL, LOCK_KEY_PREFIX, POLL_ATTEMPTS};
pub use metrics::{FunnelMetrics, LatencyTracker, MetricsSnapshot};
pub use pipeline::{EvictTiming, Funnel};
