//! Rule Manager
//!
//! Owns the live `resource → Rule` map and pushes every change into the four
//! tiers and the consistency manager.
//!
//! Changes are diff-driven. For a resource seen before, each tier compares
//! its old and new sub-config:
//!
//! | Tier        | Rebuilt when            | Otherwise        |
//! |-------------|-------------------------|------------------|
//! | L1          | max entries or TTL differ | kept as is     |
//! | L2          | window differs          | config swapped   |
//! | L3          | never                   | rule swapped     |
//! | L4          | never                   | config replaced  |
//! | Consistency | never                   | config replaced  |
//!
//! Changes to one resource are serialized; reads of the rule map never wait
//! on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::listener::RuleChangeListener;
use super::model::{ConsistencyConfig, L1Config, L2Config, L3Config, L4Config, Rule};
use crate::consistency::ConsistencyManager;
use crate::error::Result;
use crate::funnel::{HotspotDetector, LocalCache, NoiseFilter, SafeLoader};

/// Outcome of a bulk rule operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// What happened to one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChange {
    Added,
    Updated,
}

/// Authoritative rule set for one node
pub struct RuleManager {
    rules: DashMap<String, Rule>,
    guards: DashMap<String, Arc<Mutex<()>>>,
    listeners: RwLock<Vec<Arc<dyn RuleChangeListener>>>,
    local: Arc<LocalCache>,
    noise: Arc<NoiseFilter>,
    detector: Arc<HotspotDetector>,
    loader: Arc<SafeLoader>,
    consistency: Arc<ConsistencyManager>,
    shut_down: AtomicBool,
}

impl RuleManager {
    pub fn new(
        local: Arc<LocalCache>,
        noise: Arc<NoiseFilter>,
        detector: Arc<HotspotDetector>,
        loader: Arc<SafeLoader>,
        consistency: Arc<ConsistencyManager>,
    ) -> Self {
        Self {
            rules: DashMap::new(),
            guards: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            local,
            noise,
            detector,
            loader,
            consistency,
            shut_down: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn add_listener(&self, listener: Arc<dyn RuleChangeListener>) {
        debug!(listener = listener.name(), "Rule listener added");
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn RuleChangeListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Apply an initial rule list. Each rule stands alone; a bad one is
    /// logged and skipped.
    pub fn load_rules(&self, rules: Vec<Rule>) -> ApplyReport {
        if rules.is_empty() {
            warn!("No rules to load");
            return ApplyReport::default();
        }
        info!(count = rules.len(), "Loading rules");
        let report = self.apply_all(rules);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Rules loaded"
        );
        report
    }

    /// Apply a full or partial rule list from a config source. Unknown
    /// resources are added, known ones are diffed.
    pub fn update_rules(&self, rules: Vec<Rule>) -> ApplyReport {
        if rules.is_empty() {
            warn!("No rules to update");
            return ApplyReport::default();
        }
        info!(count = rules.len(), "Updating rules");
        let report = self.apply_all(rules);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Rules updated"
        );
        report
    }

    fn apply_all(&self, rules: Vec<Rule>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for rule in rules {
            let resource = rule.resource.clone();
            match self.update_rule(rule) {
                Ok(change) => {
                    report.succeeded += 1;
                    debug!(resource = %resource, ?change, "Rule applied");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(resource = %resource, error = %e, "Rule skipped");
                }
            }
        }
        report
    }

    // =========================================================================
    // Single Rule
    // =========================================================================

    /// Validate and apply one rule, then notify listeners.
    ///
    /// An invalid rule changes nothing.
    pub fn update_rule(&self, rule: Rule) -> Result<RuleChange> {
        rule.validate()?;

        let resource = rule.resource.clone();
        let guard = self.guard(&resource);
        let _held = guard.lock();

        let old = self.rules.get(&resource).map(|r| r.clone());
        match old {
            None => {
                self.apply_fresh(&rule);
                self.rules.insert(resource.clone(), rule.clone());
                info!(resource = %resource, "Rule added");
                self.notify(|l| l.on_rule_added(&rule), "added", &resource);
                Ok(RuleChange::Added)
            }
            Some(old) => {
                if old == rule {
                    debug!(resource = %resource, "Rule unchanged, re-applying");
                }
                self.apply_diff(&old, &rule);
                self.rules.insert(resource.clone(), rule.clone());
                info!(resource = %resource, "Rule updated");
                self.notify(|l| l.on_rule_updated(&old, &rule), "updated", &resource);
                Ok(RuleChange::Updated)
            }
        }
    }

    /// Clear every tier's state for `resource` and forget its rule.
    ///
    /// Returns the removed rule.
    pub fn remove_rule(&self, resource: &str) -> Option<Rule> {
        let guard = self.guard(resource);
        let _held = guard.lock();
        let Some(rule) = self.rules.get(resource).map(|r| r.clone()) else {
            warn!(resource, "Rule not found");
            return None;
        };

        self.local.remove(resource);
        self.noise.remove(resource);
        self.detector.remove_rule(resource);
        self.loader.remove_config(resource);
        self.consistency.remove_config(resource);
        self.rules.remove(resource);

        info!(resource, "Rule removed");
        self.notify(|l| l.on_rule_removed(&rule), "removed", resource);
        Some(rule)
    }

    pub fn get_rule(&self, resource: &str) -> Option<Rule> {
        self.rules.get(resource).map(|r| r.clone())
    }

    pub fn get_all_rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Remove every rule.
    pub fn clear_all(&self) {
        info!(count = self.rules.len(), "Clearing all rules");
        let resources: Vec<String> = self.rules.iter().map(|r| r.key().clone()).collect();
        for resource in resources {
            self.remove_rule(&resource);
        }
        info!("All rules cleared");
    }

    /// Clear all rules. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down rule manager");
        self.clear_all();
    }

    // =========================================================================
    // Applying
    // =========================================================================

    fn guard(&self, resource: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn apply_fresh(&self, rule: &Rule) {
        let resource = rule.resource.as_str();
        debug!(resource, "Applying new rule");

        if let Some(l1) = rule.active_l1() {
            self.local.rebuild(resource, l1);
        } else {
            self.local.remove(resource);
        }
        if let Some(l2) = rule.active_l2() {
            self.noise.rebuild(resource, l2);
        } else {
            self.noise.remove(resource);
        }
        self.apply_l3(resource, rule.active_l3());
        self.apply_l4(resource, rule.l4_config.as_ref());
        self.apply_consistency(resource, rule.consistency_config.as_ref());
    }

    fn apply_diff(&self, old: &Rule, new: &Rule) {
        let resource = new.resource.as_str();
        debug!(resource, "Applying rule diff");

        self.apply_l1(resource, old.active_l1(), new.active_l1());
        self.apply_l2(resource, old.active_l2(), new.active_l2());
        self.apply_l3(resource, new.active_l3());
        self.apply_l4(resource, new.l4_config.as_ref());
        self.apply_consistency(resource, new.consistency_config.as_ref());
    }

    fn apply_l1(&self, resource: &str, old: Option<&L1Config>, new: Option<&L1Config>) {
        match (old, new) {
            (_, None) => self.local.remove(resource),
            (Some(old), Some(new)) if !old.requires_rebuild(new) => {
                // Same shape; keep the cached entries
                self.local.get_or_create(resource, new);
                debug!(resource, "L1 cache kept");
            }
            (_, Some(new)) => self.local.rebuild(resource, new),
        }
    }

    fn apply_l2(&self, resource: &str, old: Option<&L2Config>, new: Option<&L2Config>) {
        match (old, new) {
            (_, None) => self.noise.remove(resource),
            (Some(old), Some(new)) if old.window_secs == new.window_secs => {
                self.noise.update(resource, new)
            }
            (_, Some(new)) => self.noise.rebuild(resource, new),
        }
    }

    fn apply_l3(&self, resource: &str, config: Option<&L3Config>) {
        match config {
            Some(config) => self.detector.update_rule(resource, config),
            None => self.detector.remove_rule(resource),
        }
    }

    fn apply_l4(&self, resource: &str, config: Option<&L4Config>) {
        match config {
            Some(config) => self.loader.register_config(resource, config),
            None => self.loader.remove_config(resource),
        }
    }

    fn apply_consistency(&self, resource: &str, config: Option<&ConsistencyConfig>) {
        match config {
            Some(config) => self.consistency.register_config(resource, config),
            None => self.consistency.remove_config(resource),
        }
    }

    fn notify<F>(&self, call: F, change: &str, resource: &str)
    where
        F: Fn(&dyn RuleChangeListener) -> anyhow::Result<()>,
    {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = call(listener.as_ref()) {
                error!(
                    listener = listener.name(),
                    resource,
                    change,
                    error = %e,
                    "Rule listener failed"
                );
            }
        }
    }
}
