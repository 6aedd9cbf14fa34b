//! Domain Ports (Port/Adapter Pattern)
//!
//! The funnel and the consistency layer never talk to a concrete cache
//! server, lock service or broker. They depend on the narrow traits below;
//! adapters provide the implementations and are injected at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Core                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  SharedCache │ LockService │ BroadcastBus │ DelayQueue│   │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemorySharedCache │ InMemoryLockService │ ...     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::consistency::DelayLevel;
use crate::error::Result;

/// Stream of raw payloads delivered by a subscription.
///
/// Dropping the stream unsubscribes.
pub type MessageStream = BoxStream<'static, Bytes>;

// =============================================================================
// Value Objects
// =============================================================================

/// Proof of a held lock; required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    /// Lock key
    pub key: String,
    /// Unique holder id, so a stale holder cannot release a re-acquired lock
    pub holder: String,
}

impl LockToken {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.holder)
    }
}

// =============================================================================
// Shared Cache Port
// =============================================================================

/// Cross-process key/value cache with per-entry TTL.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// =============================================================================
// Lock Port
// =============================================================================

/// Named distributed lock with bounded wait and lease.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take `key`, waiting at most `wait`. The lock is released
    /// automatically after `lease` if the holder never unlocks.
    ///
    /// Returns `None` when the wait elapsed without acquiring.
    async fn try_lock(&self, key: &str, wait: Duration, lease: Duration)
        -> Result<Option<LockToken>>;

    /// Release a lock. Releasing an expired or foreign lock is a no-op.
    async fn unlock(&self, token: &LockToken) -> Result<()>;
}

// =============================================================================
// Broadcast Port
// =============================================================================

/// Fan-out pub/sub: every subscriber of a channel sees every message.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Publish a payload to all current subscribers of `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}

// =============================================================================
// Delay Queue Port
// =============================================================================

/// Durable delayed delivery with discrete delay tiers.
///
/// Each message is delivered once, to one consumer of the topic.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Enqueue a payload for delivery after `level`.
    async fn send(&self, topic: &str, payload: Bytes, level: DelayLevel) -> Result<()>;

    /// Consume deliveries for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_tokens_are_unique() {
        let a = LockToken::new("lock:k");
        let b = LockToken::new("lock:k");
        assert_eq!(a.key, b.key);
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("lock:k#"));
    }
}
