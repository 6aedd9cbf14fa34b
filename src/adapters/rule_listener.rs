//! Rule Listener Adapters
//!
//! `RuleChangeListener` implementations that turn rule changes into
//! `RuleEvent`s and send them to the log or to memory.

use tracing::{debug, info};

use crate::domain::events::RuleEvent;
use crate::rule::{Rule, RuleChangeListener};

/// Logs every rule change as a JSON event.
#[derive(Debug, Clone, Default)]
pub struct LoggingRuleListener {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingRuleListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a listener that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }

    fn log(&self, event: RuleEvent) {
        let event_type = event.event_type();
        let resource = event.resource().to_string();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type, resource = %resource, event = %json, "Rule event");
        } else {
            debug!(event_type, resource = %resource, event = %json, "Rule event");
        }
    }
}

impl RuleChangeListener for LoggingRuleListener {
    fn on_rule_added(&self, rule: &Rule) -> anyhow::Result<()> {
        self.log(RuleEvent::added(rule));
        Ok(())
    }

    fn on_rule_updated(&self, old: &Rule, new: &Rule) -> anyhow::Result<()> {
        self.log(RuleEvent::updated(old, new));
        Ok(())
    }

    fn on_rule_removed(&self, rule: &Rule) -> anyhow::Result<()> {
        self.log(RuleEvent::removed(rule));
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Collects rule events in memory for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryRuleEventCollector {
    events: parking_lot::RwLock<Vec<RuleEvent>>,
}

impl InMemoryRuleEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<RuleEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<RuleEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl RuleChangeListener for InMemoryRuleEventCollector {
    fn on_rule_added(&self, rule: &Rule) -> anyhow::Result<()> {
        self.events.write().push(RuleEvent::added(rule));
        Ok(())
    }

    fn on_rule_updated(&self, old: &Rule, new: &Rule) -> anyhow::Result<()> {
        self.events.write().push(RuleEvent::updated(old, new));
        Ok(())
    }

    fn on_rule_removed(&self, rule: &Rule) -> anyhow::Result<()> {
        self.events.write().push(RuleEvent::removed(rule));
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
