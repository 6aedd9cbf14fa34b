//! Infrastructure Adapters
//!
//! In-process implementations of the domain ports, plus rule listeners.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  SharedCache │ LockService │ BroadcastBus │ DelayQueue     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemorySharedCache │ InMemoryLockService                  │ │
//! │  │ InMemoryBroadcastBus │ InMemoryDelayQueue                  │ │
//! │  │ LoggingRuleListener │ InMemoryRuleEventCollector           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Several funnels sharing the same adapter `Arc`s behave like nodes of one
//! cluster, which is how the integration tests run multi-node scenarios.

mod broadcast;
mod delay_queue;
mod lock;
mod rule_listener;
mod shared_cache;

pub use broadcast::InMemoryBroadcastBus;
pub use delay_queue::InMemoryDelayQueue;
pub use lock::InMemoryLockService;
pub use rule_listener::{InMemoryRuleEventCollector, LoggingRuleListener};
pub use shared_cache::InMemorySharedCache;
