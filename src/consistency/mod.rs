//! Write-path cache consistency
//!
//! - [`ConsistencyManager`]: first delete, delayed second delete, broadcast
//!   invalidation and promotion, and the receiving side of both
//! - [`delay`]: delay tiers and the two ways of running a second delete

pub mod delay;
mod manager;

pub use delay::{
    DelayLevel, DelayedDeleteConsumer, DelayedDeleteProducer, LocalDelayScheduler, DELAY_TIERS,
};
pub use manager::{ConsistencyManager, DEFAULT_SHUTDOWN_GRACE};
