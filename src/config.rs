//! Top-level settings
//!
//! Loaded from YAML:
//!
//! ```yaml
//! enabled: true
//! broadcastChannel: "hotshield:invalidate"
//! delayedDeleteTopic: "hotshield-delayed-delete"
//! shutdownGraceSecs: 30
//! rules:
//!   - resource: product
//!     l1Config: { maxEntries: 10000, ttlSecs: 60 }
//!     l2Config: { windowSecs: 10, threshold: 5 }
//!     l3Config: { qpsThreshold: 100.0, windowSecs: 1 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rule::{Rule, DEFAULT_BROADCAST_CHANNEL};

/// Default topic for durable delayed deletes.
pub const DEFAULT_DELAYED_DELETE_TOPIC: &str = "hotshield-delayed-delete";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Master switch; when off every read goes straight to the loader
    pub enabled: bool,
    pub rules: Vec<Rule>,
    /// Channel subscribed even when no rule names one
    pub broadcast_channel: String,
    pub delayed_delete_topic: String,
    /// How long shutdown waits for pending delayed deletes
    pub shutdown_grace_secs: u64,
    /// Identity used to skip our own broadcasts; random when unset
    pub node_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            broadcast_channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            delayed_delete_topic: DEFAULT_DELAYED_DELETE_TOPIC.to_string(),
            shutdown_grace_secs: 30,
            node_id: None,
        }
    }
}

impl Settings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.check()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading settings");
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Node id, generating one when unset.
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn check(&self) -> Result<()> {
        if self.broadcast_channel.trim().is_empty() {
            return Err(Error::Config("broadcastChannel cannot be empty".into()));
        }
        if self.delayed_delete_topic.trim().is_empty() {
            return Err(Error::Config("delayedDeleteTopic cannot be empty".into()));
        }
        Ok(())
    }
}

/// Parse a rules document: either a full [`Settings`] or a bare rule list.
pub fn parse_rules(yaml: &str) -> Result<Vec<Rule>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    if doc.is_sequence() {
        return Ok(serde_yaml::from_value(doc)?);
    }
    if doc.is_null() {
        return Ok(Vec::new());
    }
    let settings: Settings = serde_yaml::from_value(doc)?;
    Ok(settings.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_test::assert_ok;

    #[test]
    fn test_defaults() {
        let settings = assert_ok!(Settings::from_yaml_str("{}"));
        assert!(settings.enabled);
        assert!(settings.rules.is_empty());
        assert_eq!(settings.broadcast_channel, "hotshield:invalidate");
        assert_eq!(settings.delayed_delete_topic, "hotshield-delayed-delete");
        assert_eq!(settings.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
enabled: false
nodeId: node-a
shutdownGraceSecs: 5
rules:
  - resource: product
    l1Config:
      maxEntries: 500
      ttlSecs: 30
    l2Config:
      windowSecs: 10
      threshold: 3
  - resource: user
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.node_id(), "node-a");
        assert_eq!(settings.rules.len(), 2);

        let product = &settings.rules[0];
        assert_eq!(product.l1_config.as_ref().unwrap().max_entries, 500);
        assert_eq!(product.l2_config.as_ref().unwrap().threshold, 3);
        assert!(product.l3_config.is_none());
        assert!(settings.rules[1].l1_config.is_none());
    }

    #[test]
    fn test_empty_channel_rejected() {
        let err = Settings::from_yaml_str("broadcastChannel: ''").unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[test]
    fn test_parse_rules_accepts_both_shapes() {
        let list = "- resource: a\n- resource: b\n";
        assert_eq!(parse_rules(list).unwrap().len(), 2);

        let doc = "rules:\n  - resource: a\n";
        assert_eq!(parse_rules(doc).unwrap().len(), 1);

        assert!(parse_rules("").unwrap().is_empty());
    }

    #[test]
    fn test_generated_node_ids_differ() {
        let settings = Settings::default();
        assert_ne!(settings.node_id(), settings.node_id());
    }
}
