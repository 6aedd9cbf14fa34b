//! Rule model
//!
//! One [`Rule`] per resource. Each tier reads its own sub-config; a missing
//! sub-config means that tier is not configured for the resource.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Longest accepted resource name.
pub const MAX_RESOURCE_LEN: usize = 100;

/// Default shared-cache key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "hotshield:";

/// Default broadcast channel.
pub const DEFAULT_BROADCAST_CHANNEL: &str = "hotshield:invalidate";

/// Per-resource configuration across all tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Resource name (unique)
    pub resource: String,
    /// L1 local cache
    #[serde(default, alias = "l1")]
    pub l1_config: Option<L1Config>,
    /// L2 noise filter
    #[serde(default, alias = "l2")]
    pub l2_config: Option<L2Config>,
    /// L3 hotspot detector
    #[serde(default, alias = "l3")]
    pub l3_config: Option<L3Config>,
    /// L4 safe loader
    #[serde(default, alias = "l4")]
    pub l4_config: Option<L4Config>,
    /// Write-path consistency
    #[serde(default, alias = "consistency")]
    pub consistency_config: Option<ConsistencyConfig>,
}

impl Rule {
    /// A rule with every tier configured with defaults.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            l1_config: Some(L1Config::default()),
            l2_config: Some(L2Config::default()),
            l3_config: Some(L3Config::default()),
            l4_config: Some(L4Config::default()),
            consistency_config: Some(ConsistencyConfig::default()),
        }
    }

    pub fn with_l1(mut self, config: L1Config) -> Self {
        self.l1_config = Some(config);
        self
    }

    pub fn with_l2(mut self, config: L2Config) -> Self {
        self.l2_config = Some(config);
        self
    }

    pub fn with_l3(mut self, config: L3Config) -> Self {
        self.l3_config = Some(config);
        self
    }

    pub fn with_l4(mut self, config: L4Config) -> Self {
        self.l4_config = Some(config);
        self
    }

    pub fn with_consistency(mut self, config: ConsistencyConfig) -> Self {
        self.consistency_config = Some(config);
        self
    }

    /// L1 config when present and enabled.
    pub fn active_l1(&self) -> Option<&L1Config> {
        self.l1_config.as_ref().filter(|c| c.enabled)
    }

    /// L2 config when present and enabled.
    pub fn active_l2(&self) -> Option<&L2Config> {
        self.l2_config.as_ref().filter(|c| c.enabled)
    }

    /// L3 config when present and enabled.
    pub fn active_l3(&self) -> Option<&L3Config> {
        self.l3_config.as_ref().filter(|c| c.enabled)
    }

    /// Check every sub-config. Fails on the first violation.
    pub fn validate(&self) -> Result<()> {
        let resource = self.resource.as_str();
        if resource.trim().is_empty() {
            return Err(Error::invalid_rule(resource, "resource cannot be empty"));
        }
        if resource.chars().count() > MAX_RESOURCE_LEN {
            return Err(Error::invalid_rule(
                resource,
                format!(
                    "resource name too long (max {} chars): {}",
                    MAX_RESOURCE_LEN,
                    resource.chars().count()
                ),
            ));
        }

        if let Some(l1) = self.active_l1() {
            l1.validate(resource)?;
        }
        if let Some(l2) = self.active_l2() {
            l2.validate(resource)?;
        }
        if let Some(l3) = self.active_l3() {
            l3.validate(resource)?;
        }
        if let Some(l4) = &self.l4_config {
            l4.validate(resource)?;
        }
        if let Some(consistency) = &self.consistency_config {
            consistency.validate(resource)?;
        }

        debug!(resource, "Rule validated");
        Ok(())
    }
}

// =============================================================================
// L1
// =============================================================================

/// Local cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: u64,
    /// Time-to-live from write, in seconds
    pub ttl_secs: u64,
    pub enabled: bool,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 60,
            enabled: true,
        }
    }
}

impl L1Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Capacity or TTL changes need a fresh cache instance.
    pub fn requires_rebuild(&self, other: &L1Config) -> bool {
        self.max_entries != other.max_entries || self.ttl_secs != other.ttl_secs
    }

    fn validate(&self, resource: &str) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::invalid_rule(resource, "L1 maxEntries must be positive"));
        }
        if self.ttl_secs == 0 {
            return Err(Error::invalid_rule(resource, "L1 ttlSecs must be positive"));
        }
        if self.max_entries > 1_000_000 {
            warn!(
                resource,
                max_entries = self.max_entries,
                "L1 maxEntries is very large, memory use may be high"
            );
        }
        Ok(())
    }
}

// =============================================================================
// L2
// =============================================================================

/// Noise filter window and threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct L2Config {
    /// Counting window, in seconds
    pub window_secs: u64,
    /// Count at which a key stops being noise
    pub threshold: u64,
    pub enabled: bool,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            window_secs: 10,
            threshold: 5,
            enabled: true,
        }
    }
}

impl L2Config {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn validate(&self, resource: &str) -> Result<()> {
        if self.window_secs == 0 {
            return Err(Error::invalid_rule(resource, "L2 windowSecs must be positive"));
        }
        if self.threshold == 0 {
            return Err(Error::invalid_rule(resource, "L2 threshold must be positive"));
        }
        if self.window_secs > 3600 {
            warn!(
                resource,
                window_secs = self.window_secs,
                "L2 window is very large, counters will be held for a long time"
            );
        }
        Ok(())
    }
}

// =============================================================================
// L3
// =============================================================================

/// Hotspot detection threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct L3Config {
    /// Requests per second per key above which the key is a hotspot
    pub qps_threshold: f64,
    /// Statistics window, in seconds
    pub window_secs: u64,
    pub enabled: bool,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            qps_threshold: 100.0,
            window_secs: 1,
            enabled: true,
        }
    }
}

impl L3Config {
    fn validate(&self, resource: &str) -> Result<()> {
        if !self.qps_threshold.is_finite() || self.qps_threshold <= 0.0 {
            return Err(Error::invalid_rule(
                resource,
                format!("L3 qpsThreshold must be positive, got {}", self.qps_threshold),
            ));
        }
        if self.window_secs == 0 {
            return Err(Error::invalid_rule(resource, "L3 windowSecs must be positive"));
        }
        if self.qps_threshold < 1.0 {
            warn!(
                resource,
                qps_threshold = self.qps_threshold,
                "L3 qpsThreshold is below 1, almost every key will be a hotspot"
            );
        }
        Ok(())
    }
}

// =============================================================================
// L4
// =============================================================================

/// Shared cache and lock timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct L4Config {
    /// Prefix for shared-cache keys
    pub key_prefix: String,
    /// Shared-cache TTL, in seconds
    pub shared_ttl_secs: u64,
    /// How long to wait for the load lock, in milliseconds
    pub lock_wait_ms: u64,
    /// Lease on the load lock, in milliseconds
    pub lock_lease_ms: u64,
}

impl Default for L4Config {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            shared_ttl_secs: 300,
            lock_wait_ms: 3_000,
            lock_lease_ms: 5_000,
        }
    }
}

impl L4Config {
    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    fn validate(&self, resource: &str) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(Error::invalid_rule(resource, "L4 keyPrefix cannot be empty"));
        }
        if self.shared_ttl_secs == 0 {
            return Err(Error::invalid_rule(resource, "L4 sharedTtlSecs must be positive"));
        }
        if self.lock_wait_ms == 0 {
            return Err(Error::invalid_rule(resource, "L4 lockWaitMs must be positive"));
        }
        if self.lock_lease_ms == 0 {
            return Err(Error::invalid_rule(resource, "L4 lockLeaseMs must be positive"));
        }
        if self.lock_lease_ms < self.lock_wait_ms {
            warn!(
                resource,
                lock_lease_ms = self.lock_lease_ms,
                lock_wait_ms = self.lock_wait_ms,
                "L4 lock lease is shorter than lock wait"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Consistency
// =============================================================================

/// Write-path invalidation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsistencyConfig {
    /// Delete again after `delay_ms`
    pub enable_delayed_delete: bool,
    pub delay_ms: u64,
    /// Tell other nodes to drop their local copy
    pub enable_broadcast: bool,
    pub channel: String,
    /// Tell other nodes about newly detected hotspots
    pub enable_promotion_broadcast: bool,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            enable_delayed_delete: true,
            delay_ms: 5_000,
            enable_broadcast: true,
            channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            enable_promotion_broadcast: true,
        }
    }
}

impl ConsistencyConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    fn validate(&self, resource: &str) -> Result<()> {
        if self.enable_delayed_delete && self.delay_ms == 0 {
            return Err(Error::invalid_rule(
                resource,
                "consistency delayMs must be positive when delayed delete is enabled",
            ));
        }
        if self.channel.is_empty() {
            return Err(Error::invalid_rule(resource, "consistency channel cannot be empty"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
