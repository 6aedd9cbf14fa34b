//! In-Process Broadcast Adapter
//!
//! Implements the `BroadcastBus` port on `tokio::sync::broadcast`, one
//! channel per name. Subscribers that fall behind skip the messages they
//! missed, the way a pub/sub server drops them for slow consumers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::domain::ports::{BroadcastBus, MessageStream};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

/// Named fan-out channels.
#[derive(Debug, Default)]
pub struct InMemoryBroadcastBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    published: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryBroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publish and subscribe fail, to exercise degraded paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages published so far, across all channels.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Live subscribers of `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Broadcast("broadcast bus unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BroadcastBus for InMemoryBroadcastBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.check()?;
        // No subscribers is not an error for pub/sub
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        self.published.fetch_add(1, Ordering::SeqCst);
        trace!(channel, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.check()?;
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, channel))),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(messages))
    }
}
