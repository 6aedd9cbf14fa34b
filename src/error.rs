//! Error types for HotShield

use std::fmt;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in HotShield
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Backing-store load failed; carries the classified reason
    #[error("Load failed for {resource}:{key} ({reason}): {source}")]
    Load {
        resource: String,
        key: String,
        reason: LoadFailureReason,
        #[source]
        source: anyhow::Error,
    },

    /// Shared cache read/write error
    #[error("Shared cache error: {0}")]
    SharedCache(String),

    /// Distributed lock error
    #[error("Lock error: {0}")]
    Lock(String),

    /// Broadcast publish/subscribe error
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Delayed-delete queue error
    #[error("Delay queue error: {0}")]
    DelayQueue(String),

    /// Rule failed validation
    #[error("Invalid rule for resource '{resource}': {reason}")]
    InvalidRule { resource: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML decode error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Component is shutting down and refuses new work
    #[error("Shutting down")]
    ShuttingDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an `InvalidRule` error.
    pub fn invalid_rule(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRule {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Classified reason when this is a load failure.
    pub fn load_reason(&self) -> Option<LoadFailureReason> {
        match self {
            Error::Load { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

// =============================================================================
// Load Failure Classification
// =============================================================================

/// Why a backing-store load failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadFailureReason {
    /// The backing store itself reported an error
    BackingStore,
    /// The load timed out
    Timeout,
    /// Shared cache failure surfaced through the loader
    SharedCache,
    /// Lock failure surfaced through the loader
    Lock,
    /// Anything else
    Unknown,
}

impl LoadFailureReason {
    /// Best-effort classification of a loader failure.
    ///
    /// Typed errors anywhere in the chain win; message text is only consulted
    /// when nothing in the chain is recognised.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.is::<tokio::time::error::Elapsed>() {
                return LoadFailureReason::Timeout;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return if io.kind() == std::io::ErrorKind::TimedOut {
                    LoadFailureReason::Timeout
                } else {
                    LoadFailureReason::BackingStore
                };
            }
            if cause.is::<SourceError>() {
                return LoadFailureReason::BackingStore;
            }
            if let Some(own) = cause.downcast_ref::<Error>() {
                match own {
                    Error::SharedCache(_) => return LoadFailureReason::SharedCache,
                    Error::Lock(_) => return LoadFailureReason::Lock,
                    Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                        return LoadFailureReason::Timeout
                    }
                    Error::Io(_) => return LoadFailureReason::BackingStore,
                    _ => {}
                }
            }
        }

        let message = err.to_string().to_lowercase();
        if message.contains("timeout") || message.contains("timed out") {
            LoadFailureReason::Timeout
        } else if message.contains("redis") || message.contains("shared cache") {
            LoadFailureReason::SharedCache
        } else if message.contains("lock") {
            LoadFailureReason::Lock
        } else {
            LoadFailureReason::Unknown
        }
    }
}

impl fmt::Display for LoadFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailureReason::BackingStore => write!(f, "backing store error"),
            LoadFailureReason::Timeout => write!(f, "timeout"),
            LoadFailureReason::SharedCache => write!(f, "shared cache error"),
            LoadFailureReason::Lock => write!(f, "lock error"),
            LoadFailureReason::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Error a loader can return to mark a failure as coming from the backing store.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
