//! In-Process Lock Adapter
//!
//! Implements the `LockService` port. Waiters park on a `Notify` and also
//! re-check on a short tick so an expired lease is picked up without an
//! explicit unlock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::domain::ports::{LockService, LockToken};
use crate::error::Result;

const RECHECK_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Held {
    holder: String,
    expires_at: Instant,
}

/// Lease-based named locks.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    locks: DashMap<String, Held>,
    released: Notify,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|h| h.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn try_acquire(&self, key: &str, lease: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let token = LockToken::new(key);
        let held = Held {
            holder: token.holder.clone(),
            expires_at: now + lease,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(held);
                Some(token)
            }
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                slot.insert(held);
                Some(token)
            }
            Entry::Occupied(_) => None,
        }
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            if let Some(token) = self.try_acquire(key, lease) {
                trace!(key, "lock acquired");
                return Ok(Some(token));
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(key, "lock wait elapsed");
                return Ok(None);
            }
            let _ = tokio::time::timeout((deadline - now).min(RECHECK_TICK), notified).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let removed = self
            .locks
            .remove_if(&token.key, |_, held| held.holder == token.holder)
            .is_some();
        if removed {
            trace!(key = %token.key, "lock released");
            self.released.notify_waiters();
        }
        Ok(())
    }
}
