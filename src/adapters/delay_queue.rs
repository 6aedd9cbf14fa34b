//! In-Process Delay Queue Adapter
//!
//! Implements the `DelayQueue` port. Each message is held for its delay
//! tier and then handed to exactly one of the topic's consumers. A time
//! scale can shrink the tiers so tests do not wait whole seconds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::consistency::DelayLevel;
use crate::domain::ports::{DelayQueue, MessageStream};
use crate::error::{Error, Result};

struct Topic {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Bytes>>>,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Timer-backed delay queue.
pub struct InMemoryDelayQueue {
    topics: DashMap<String, Topic>,
    divisor: u32,
    sent: RwLock<Vec<(String, DelayLevel)>>,
}

impl Default for InMemoryDelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDelayQueue {
    pub fn new() -> Self {
        Self::with_time_divisor(1)
    }

    /// Deliver after `tier / divisor` instead of the full tier.
    pub fn with_time_divisor(divisor: u32) -> Self {
        Self {
            topics: DashMap::new(),
            divisor: divisor.max(1),
            sent: RwLock::new(Vec::new()),
        }
    }

    /// Every `(topic, level)` accepted so far.
    pub fn sent(&self) -> Vec<(String, DelayLevel)> {
        self.sent.read().clone()
    }

    fn sender(&self, topic: &str) -> mpsc::UnboundedSender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .tx
            .clone()
    }

    fn receiver(&self, topic: &str) -> Arc<Mutex<mpsc::UnboundedReceiver<Bytes>>> {
        Arc::clone(
            &self
                .topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new)
                .rx,
        )
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    async fn send(&self, topic: &str, payload: Bytes, level: DelayLevel) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::DelayQueue(format!("no runtime: {}", e)))?;
        let delay: Duration = level.duration() / self.divisor;
        let tx = self.sender(topic);

        self.sent.write().push((topic.to_string(), level));
        trace!(topic, level = level.level(), delay_ms = delay.as_millis() as u64, "delayed message accepted");

        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(payload);
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream> {
        let rx = self.receiver(topic);
        let deliveries = stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|payload| (payload, rx))
        });
        Ok(Box::pin(deliveries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_delivered_after_scaled_tier() {
        let queue = InMemoryDelayQueue::with_time_divisor(20);
        let mut stream = queue.subscribe("t").await.unwrap();

        let level = DelayLevel::for_delay(Duration::from_secs(1));
        queue.send("t", Bytes::from_static(b"m"), level).await.unwrap();

        // 1s / 20 = 50ms
        let early = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(early.is_err());
        let payload = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"m"));
        assert_eq!(queue.sent(), vec![("t".to_string(), level)]);
    }

    #[tokio::test]
    async fn test_single_consumer_per_message() {
        let queue = InMemoryDelayQueue::with_time_divisor(100);
        let mut a = queue.subscribe("t").await.unwrap();
        let mut b = queue.subscribe("t").await.unwrap();

        queue
            .send("t", Bytes::from_static(b"once"), DelayLevel::for_delay(Duration::ZERO))
            .await
            .unwrap();

        let first = tokio::select! {
            Some(p) = a.next() => p,
            Some(p) = b.next() => p,
        };
        assert_eq!(first, Bytes::from_static(b"once"));

        let again = tokio::time::timeout(Duration::from_millis(50), async {
            tokio::select! {
                Some(p) = a.next() => p,
                Some(p) = b.next() => p,
            }
        })
        .await;
        assert!(again.is_err());
    }
}
