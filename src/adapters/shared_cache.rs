//! In-Process Shared Cache Adapter
//!
//! Implements the `SharedCache` port with a concurrent map and lazy expiry.
//! Several funnels built on the same `Arc` behave like nodes sharing one
//! cache server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::domain::ports::SharedCache;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    ttl: Duration,
    expires_at: Instant,
}

/// Map-backed shared cache.
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    entries: DashMap<String, Entry>,
    failing: AtomicBool,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, to exercise degraded paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL the live entry under `key` was written with.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.ttl)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::SharedCache("shared cache unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check()?;
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        trace!(key, hit = value.is_some(), "shared get");
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        trace!(key, ttl_ms = ttl.as_millis() as u64, "shared set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.remove(key);
        trace!(key, "shared delete");
        Ok(())
    }
}
