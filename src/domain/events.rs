//! Wire Messages and Rule Events
//!
//! Messages exchanged between nodes over the broadcast bus and the delay
//! queue, plus the rule-change events handed to listeners.
//!
//! # Broadcast wire format
//!
//! ```text
//! {"kind":"INVALIDATE","resource":"product","key":"42","origin":"<node>"}
//! {"kind":"PROMOTE","resource":"product","key":"42","value":{...},"origin":"<node>",
//!  "publishedAt":"2024-05-01T10:00:00Z"}
//! {"resource":"product","key":"42"}      <- legacy, read as INVALIDATE
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::funnel::{CacheKey, CacheValue, Context};
use crate::rule::Rule;

// =============================================================================
// Broadcast
// =============================================================================

/// Cross-node cache notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessage {
    /// Drop the local copy of a key.
    Invalidate {
        resource: String,
        #[serde(deserialize_with = "deserialize_key")]
        key: CacheKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    /// A key became hot on some node; warm the local copy.
    ///
    /// Receivers drop a promotion published before their last invalidation
    /// of the same key.
    Promote {
        resource: String,
        #[serde(deserialize_with = "deserialize_key")]
        key: CacheKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<CacheValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        #[serde(
            default,
            rename = "publishedAt",
            skip_serializing_if = "Option::is_none"
        )]
        published_at: Option<DateTime<Utc>>,
    },
}

/// Pre-tagging message shape: a bare context.
#[derive(Deserialize)]
struct LegacyContext {
    resource: String,
    #[serde(deserialize_with = "deserialize_key")]
    key: CacheKey,
}

impl BroadcastMessage {
    pub fn invalidate(ctx: &Context, origin: Option<String>) -> Self {
        BroadcastMessage::Invalidate {
            resource: ctx.resource().to_string(),
            key: ctx.key().clone(),
            origin,
        }
    }

    pub fn promote(ctx: &Context, value: Option<CacheValue>, origin: Option<String>) -> Self {
        BroadcastMessage::Promote {
            resource: ctx.resource().to_string(),
            key: ctx.key().clone(),
            value,
            origin,
            published_at: Some(Utc::now()),
        }
    }

    /// Context the message refers to.
    pub fn context(&self) -> Context {
        match self {
            BroadcastMessage::Invalidate { resource, key, .. }
            | BroadcastMessage::Promote { resource, key, .. } => {
                Context::new(resource.clone(), key.clone())
            }
        }
    }

    /// Node that published the message, when known.
    pub fn origin(&self) -> Option<&str> {
        match self {
            BroadcastMessage::Invalidate { origin, .. }
            | BroadcastMessage::Promote { origin, .. } => origin.as_deref(),
        }
    }

    /// When a promotion was published; `None` for invalidations and for
    /// senders that do not stamp messages.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        match self {
            BroadcastMessage::Promote { published_at, .. } => *published_at,
            BroadcastMessage::Invalidate { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::Invalidate { .. } => "INVALIDATE",
            BroadcastMessage::Promote { .. } => "PROMOTE",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a tagged message, falling back to the legacy bare context.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<BroadcastMessage>(payload) {
            Ok(message) => Ok(message),
            Err(tagged_err) => match serde_json::from_slice::<LegacyContext>(payload) {
                Ok(legacy) => Ok(BroadcastMessage::Invalidate {
                    resource: legacy.resource,
                    key: legacy.key,
                    origin: None,
                }),
                Err(_) => Err(tagged_err.into()),
            },
        }
    }
}

/// Keys arrive as strings from this crate and as numbers from older senders.
fn deserialize_key<'de, D>(deserializer: D) -> std::result::Result<CacheKey, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => CacheKey::from(s),
        other => CacheKey::new(other),
    })
}

// =============================================================================
// Delayed Delete
// =============================================================================

/// Second-delete request carried by the delay queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedDeleteMessage {
    pub resource: String,
    pub key: CacheKey,
}

impl DelayedDeleteMessage {
    pub fn new(ctx: &Context) -> Self {
        Self {
            resource: ctx.resource().to_string(),
            key: ctx.key().clone(),
        }
    }

    pub fn context(&self) -> Context {
        Context::new(self.resource.clone(), self.key.clone())
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// =============================================================================
// Rule Events
// =============================================================================

/// A rule change as seen by listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleEvent {
    RuleAdded {
        rule: Rule,
        timestamp: DateTime<Utc>,
    },
    RuleUpdated {
        old: Rule,
        new: Rule,
        timestamp: DateTime<Utc>,
    },
    RuleRemoved {
        rule: Rule,
        timestamp: DateTime<Utc>,
    },
}

impl RuleEvent {
    pub fn added(rule: &Rule) -> Self {
        RuleEvent::RuleAdded {
            rule: rule.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn updated(old: &Rule, new: &Rule) -> Self {
        RuleEvent::RuleUpdated {
            old: old.clone(),
            new: new.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn removed(rule: &Rule) -> Self {
        RuleEvent::RuleRemoved {
            rule: rule.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            RuleEvent::RuleAdded { .. } => "RuleAdded",
            RuleEvent::RuleUpdated { .. } => "RuleUpdated",
            RuleEvent::RuleRemoved { .. } => "RuleRemoved",
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            RuleEvent::RuleAdded { rule, .. } | RuleEvent::RuleRemoved { rule, .. } => {
                &rule.resource
            }
            RuleEvent::RuleUpdated { new, .. } => &new.resource,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RuleEvent::RuleAdded { timestamp, .. }
            | RuleEvent::RuleUpdated { timestamp, .. }
            | RuleEvent::RuleRemoved { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_wire_format() {
        let ctx = Context::new("product", "42");
        let msg = BroadcastMessage::invalidate(&ctx, Some("node-a".into()));
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"kind": "INVALIDATE", "resource": "product", "key": "42", "origin": "node-a"})
        );

        let msg = BroadcastMessage::promote(&ctx, Some(json!({"price": 10})), None);
        assert!(msg.published_at().is_some());
        let mut json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        let published = json.as_object_mut().unwrap().remove("publishedAt");
        assert!(published.unwrap().is_string());
        assert_eq!(
            json,
            json!({"kind": "PROMOTE", "resource": "product", "key": "42", "value": {"price": 10}})
        );
        assert_eq!(BroadcastMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_tagged() {
        let payload = br#"{"kind":"PROMOTE","resource":"product","key":"7"}"#;
        let msg = BroadcastMessage::decode(payload).unwrap();
        assert_eq!(msg.kind(), "PROMOTE");
        assert_eq!(msg.context(), Context::new("product", "7"));
        assert!(msg.origin().is_none());
        assert!(matches!(msg, BroadcastMessage::Promote { value: None, .. }));
        assert!(msg.published_at().is_none());
    }

    #[test]
    fn test_decode_tagged_numeric_key_keeps_kind() {
        let payload = br#"{"kind":"PROMOTE","resource":"product","key":7,"value":"v"}"#;
        let msg = BroadcastMessage::decode(payload).unwrap();
        assert_eq!(msg.kind(), "PROMOTE");
        assert_eq!(msg.context(), Context::new("product", 7u64));

        let payload = br#"{"kind":"INVALIDATE","resource":"product","key":-3}"#;
        let msg = BroadcastMessage::decode(payload).unwrap();
        assert_eq!(msg.kind(), "INVALIDATE");
        assert_eq!(msg.context().key().as_str(), "-3");
    }

    #[test]
    fn test_decode_legacy_context_as_invalidate() {
        let msg = BroadcastMessage::decode(br#"{"resource":"product","key":"9"}"#).unwrap();
        assert_eq!(msg.kind(), "INVALIDATE");
        assert_eq!(msg.context(), Context::new("product", "9"));

        // Legacy senders may use numeric keys
        let msg = BroadcastMessage::decode(br#"{"resource":"product","key":9}"#).unwrap();
        assert_eq!(msg.context().key().as_str(), "9");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(BroadcastMessage::decode(b"not json").is_err());
        assert!(BroadcastMessage::decode(br#"{"kind":"EXPLODE"}"#).is_err());
    }

    #[test]
    fn test_delayed_delete_message() {
        let ctx = Context::new("user:detail", 5u64);
        let msg = DelayedDeleteMessage::new(&ctx);
        let decoded = DelayedDeleteMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.context(), ctx);
    }

    #[test]
    fn test_rule_event_accessors() {
        let old = Rule::new("product");
        let new = Rule::new("product");
        let event = RuleEvent::updated(&old, &new);
        assert_eq!(event.event_type(), "RuleUpdated");
        assert_eq!(event.resource(), "product");
        assert!(event.timestamp() <= Utc::now());

        let json = serde_json::to_value(RuleEvent::added(&new)).unwrap();
        assert_eq!(json["type"], "RuleAdded");
    }
}
