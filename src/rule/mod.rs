//! Rules
//!
//! - [`model`]: the per-resource [`Rule`] and its tier configs
//! - [`RuleManager`]: applies rule changes to the running tiers
//! - [`RuleChangeListener`]: observers of applied changes
//! - [`ConfigSource`]: where rules come from

mod listener;
mod manager;
pub mod model;
mod source;

pub use listener::RuleChangeListener;
pub use manager::{ApplyReport, RuleChange, RuleManager};
pub use model::{
    ConsistencyConfig, L1Config, L2Config, L3Config, L4Config, Rule, DEFAULT_BROADCAST_CHANNEL,
    DEFAULT_KEY_PREFIX, MAX_RESOURCE_LEN,
};
pub use source::{
    ConfigSource, RulesCallback, StaticConfigSource, YamlFileConfigSource, DEFAULT_POLL_INTERVAL,
};
