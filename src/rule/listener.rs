//! Rule change observers.

use crate::rule::Rule;

/// Callback set notified after each successful rule change.
///
/// Listeners run synchronously on the thread applying the change. An error
/// from one listener is logged and does not affect the others or the change
/// itself.
pub trait RuleChangeListener: Send + Sync {
    fn on_rule_added(&self, _rule: &Rule) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_rule_updated(&self, _old: &Rule, _new: &Rule) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_rule_removed(&self, _rule: &Rule) -> anyhow::Result<()> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
