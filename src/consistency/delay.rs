//! Delayed second delete
//!
//! Two ways to run the second delete of a delayed double-delete:
//!
//! - [`DelayedDeleteProducer`] / [`DelayedDeleteConsumer`]: through a durable
//!   [`DelayQueue`]; survives a restart and may be consumed by any node
//! - [`LocalDelayScheduler`]: an in-process timer; lost if the process dies

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::manager::ConsistencyManager;
use crate::domain::events::DelayedDeleteMessage;
use crate::domain::ports::DelayQueue;
use crate::error::{Error, Result};
use crate::funnel::Context;

// =============================================================================
// Delay Levels
// =============================================================================

/// Delay tiers supported by tiered delay queues, in level order.
pub const DELAY_TIERS: [Duration; 18] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(3 * 60),
    Duration::from_secs(4 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(6 * 60),
    Duration::from_secs(7 * 60),
    Duration::from_secs(8 * 60),
    Duration::from_secs(9 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(20 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
];

/// One delay tier, 1-based like broker delay levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DelayLevel(u8);

impl DelayLevel {
    /// Smallest tier that is at least `delay`; the top tier when `delay`
    /// exceeds every tier.
    pub fn for_delay(delay: Duration) -> Self {
        let index = DELAY_TIERS
            .iter()
            .position(|tier| *tier >= delay)
            .unwrap_or(DELAY_TIERS.len() - 1);
        DelayLevel(index as u8 + 1)
    }

    /// Level by number; `None` outside `1..=18`.
    pub fn from_level(level: u8) -> Option<Self> {
        (1..=DELAY_TIERS.len() as u8)
            .contains(&level)
            .then_some(DelayLevel(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    pub fn duration(&self) -> Duration {
        DELAY_TIERS[self.0 as usize - 1]
    }
}

// =============================================================================
// Durable Path
// =============================================================================

/// Sends second-delete requests to the delay queue.
#[derive(Clone)]
pub struct DelayedDeleteProducer {
    queue: Arc<dyn DelayQueue>,
    topic: String,
}

impl DelayedDeleteProducer {
    pub fn new(queue: Arc<dyn DelayQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue a second delete for `ctx`, rounded up to the next delay tier.
    pub async fn send(&self, ctx: &Context, delay: Duration) -> Result<DelayLevel> {
        let level = DelayLevel::for_delay(delay);
        let payload = DelayedDeleteMessage::new(ctx).encode()?;
        self.queue.send(&self.topic, payload, level).await?;

        debug!(
            resource = ctx.resource(),
            key = %ctx.key(),
            requested_ms = delay.as_millis() as u64,
            level = level.level(),
            "Delayed delete enqueued"
        );
        Ok(level)
    }
}

/// Runs the second delete for every message delivered on the topic.
pub struct DelayedDeleteConsumer {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl DelayedDeleteConsumer {
    /// Subscribe to `topic` and start consuming in the background.
    pub async fn start(
        queue: Arc<dyn DelayQueue>,
        topic: &str,
        manager: Arc<ConsistencyManager>,
    ) -> Result<Self> {
        let mut stream = queue.subscribe(topic).await?;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let token = cancel.clone();
        let topic_name = topic.to_string();
        tracker.spawn(async move {
            info!(topic = %topic_name, "Delayed delete consumer started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => {
                        let Some(payload) = next else { break };
                        match DelayedDeleteMessage::decode(&payload) {
                            Ok(message) => {
                                let ctx = message.context();
                                manager.invalidate_cache(&ctx).await;
                                info!(
                                    resource = ctx.resource(),
                                    key = %ctx.key(),
                                    "Delayed delete executed"
                                );
                            }
                            Err(e) => {
                                error!(topic = %topic_name, error = %e, "Dropping undecodable delayed delete message");
                            }
                        }
                    }
                }
            }
            info!(topic = %topic_name, "Delayed delete consumer stopped");
        });
        tracker.close();

        Ok(Self { cancel, tracker })
    }

    /// Stop consuming and wait for the consumer task to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

// =============================================================================
// In-Process Path
// =============================================================================

/// In-process timer for second deletes when no delay queue is configured.
pub struct LocalDelayScheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl Default for LocalDelayScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDelayScheduler {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `task` after `delay`. Fails once shutdown has begun or when
    /// called outside a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(Error::ShuttingDown);
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no runtime for delayed task: {}", e)))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => task.await,
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            },
            &handle,
        );
        Ok(())
    }

    /// Tasks scheduled and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Refuse new tasks, give in-flight ones `grace` to finish, then cancel
    /// the rest. Returns how many were dropped.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("Local delayed deletes drained");
            return 0;
        }

        let dropped = self.pending();
        self.cancel.cancel();
        self.tracker.wait().await;
        warn!(dropped, "Delayed deletes cancelled at shutdown");
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_delay_level_rounding() {
        assert_eq!(DelayLevel::for_delay(Duration::ZERO).level(), 1);
        assert_eq!(DelayLevel::for_delay(Duration::from_millis(500)).level(), 1);
        assert_eq!(DelayLevel::for_delay(Duration::from_secs(1)).level(), 1);
        assert_eq!(DelayLevel::for_delay(Duration::from_millis(1_001)).level(), 2);
        assert_eq!(DelayLevel::for_delay(Duration::from_secs(5)).level(), 2);
        assert_eq!(DelayLevel::for_delay(Duration::from_secs(45)).level(), 5);
        assert_eq!(
            DelayLevel::for_delay(Duration::from_secs(90)).duration(),
            Duration::from_secs(120)
        );
        assert_eq!(DelayLevel::for_delay(Duration::from_secs(3 * 3600)).level(), 18);
    }

    #[test]
    fn test_from_level_bounds() {
        assert!(DelayLevel::from_level(0).is_none());
        assert!(DelayLevel::from_level(19).is_none());
        assert_eq!(
            DelayLevel::from_level(18).unwrap().duration(),
            Duration::from_secs(7200)
        );
    }

    proptest! {
        #[test]
        fn prop_level_is_smallest_tier_not_below_delay(ms in 0u64..10_000_000) {
            let delay = Duration::from_millis(ms);
            let level = DelayLevel::for_delay(delay);
            let tier = level.duration();
            if delay <= DELAY_TIERS[DELAY_TIERS.len() - 1] {
                prop_assert!(tier >= delay);
                if level.level() > 1 {
                    let below = DelayLevel::from_level(level.level() - 1).unwrap();
                    prop_assert!(below.duration() < delay);
                }
            } else {
                prop_assert_eq!(level.level(), 18);
            }
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_task_after_delay() {
        let scheduler = LocalDelayScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        scheduler
            .schedule(Duration::from_millis(20), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.shutdown(Duration::from_millis(10)).await, 0);
    }

    #[tokio::test]
    async fn test_scheduler_shutdown_drops_pending() {
        let scheduler = LocalDelayScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));

        for _ in 0..3 {
            let flag = Arc::clone(&ran);
            scheduler
                .schedule(Duration::from_secs(60), async move {
                    flag.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        let dropped = scheduler.shutdown(Duration::from_millis(20)).await;
        assert_eq!(dropped, 3);
        assert!(!ran.load(Ordering::SeqCst));

        let refused = scheduler.schedule(Duration::from_millis(1), async {});
        assert!(matches!(refused, Err(Error::ShuttingDown)));
    }
}
