//! HotShield - Hotspot Key Protection
//!
//! Shields a backing store from hot keys. Reads pass through a four-level
//! funnel that only lets a small share of traffic reach the store; writes
//! invalidate with an immediate delete, a delayed second delete and a
//! cluster-wide broadcast.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! read ─────▶│ L1 LocalCache│──▶│ L2 Noise     │──▶│ L3 Hotspot   │──▶│ L4 SafeLoader│──▶ store
//!            │  (per node)  │   │   Filter     │   │   Detector   │   │ shared+lock  │
//!            └──────▲───────┘   └──────────────┘   └──────────────┘   └──────┬───────┘
//!                   └────────────────── promotion of hot keys ───────────────┘
//!
//! write ────▶ ConsistencyManager: delete now ─▶ delete again later ─▶ broadcast
//! ```
//!
//! Rules are per resource and can change at runtime through the
//! [`RuleManager`](rule::RuleManager), which rebuilds or updates each tier as
//! the change requires.
//!
//! # Modules
//!
//! - [`adapters`] - In-process implementations of the ports
//! - [`config`] - Top-level settings
//! - [`consistency`] - Write-path invalidation and broadcast
//! - [`domain`] - Ports and wire messages
//! - [`error`] - Error types
//! - [`funnel`] - The read funnel and its wrappers
//! - [`rule`] - Rules, rule manager and rule sources
//! - [`shield`] - Facade wiring everything together

pub mod adapters;
pub mod config;
pub mod consistency;
pub mod domain;
pub mod error;
pub mod funnel;
pub mod rule;
pub mod shield;

// Re-export commonly used types
pub use config::Settings;
pub use consistency::ConsistencyManager;
pub use error::{Error, LoadFailureReason, Result};
pub use funnel::{CacheKey, CacheValue, Cached, Context, EvictTiming, Evicted, Funnel};
pub use rule::{Rule, RuleManager};
pub use shield::{HotShield, HotShieldBuilder};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
