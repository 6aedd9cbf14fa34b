//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - capabilities the core calls through: shared
//!   cache, distributed lock, broadcast bus, delay queue
//! - **Events** (`events.rs`) - broadcast and delayed-delete wire messages,
//!   rule-change events
//!
//! # Usage
//!
//! ```ignore
//! use hotshield::domain::ports::SharedCache;
//!
//! async fn warm<S: SharedCache>(cache: &S, key: &str) -> hotshield::Result<bool> {
//!     Ok(cache.get(key).await?.is_some())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{BroadcastMessage, DelayedDeleteMessage, RuleEvent};
pub use ports::{BroadcastBus, DelayQueue, LockService, LockToken, MessageStream, SharedCache};
