//! Invocation context and key types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value type stored in every tier.
///
/// Values are held as JSON so the same value can live in the local cache,
/// the shared cache and a promotion broadcast without a per-type codec.
pub type CacheValue = serde_json::Value;

/// Opaque cache key.
///
/// Any displayable value can be a key; equality is on the rendered form, which
/// is also what the shared-cache key layout uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl fmt::Display) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for CacheKey {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

/// One protected call: which resource domain it belongs to and which key it reads.
///
/// Immutable after construction. The loader travels separately as a closure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    resource: String,
    key: CacheKey,
}

impl Context {
    pub fn new(resource: impl Into<String>, key: impl Into<CacheKey>) -> Self {
        Self {
            resource: resource.into(),
            key: key.into(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// A context with a blank resource bypasses every tier.
    pub fn is_valid(&self) -> bool {
        !self.resource.trim().is_empty()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.key)
    }
}
