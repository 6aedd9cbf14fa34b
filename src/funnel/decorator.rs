//! Function wrappers over the funnel.
//!
//! [`Cached`] protects a read function, [`Evicted`] a write function. Both
//! take the wrapped function as a closure over its arguments and a
//! [`KeyExtractor`] that derives the cache key from those arguments.
//!
//! ```ignore
//! let get_product = Cached::new(funnel.clone(), "product", |id: &u64| Some(CacheKey::from(*id)),
//!     move |id: u64| { let db = db.clone(); async move { db.find(id).await } });
//!
//! let product: Option<Product> = get_product.call(42).await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::context::{CacheKey, Context};
use super::pipeline::{EvictTiming, Funnel};
use crate::error::Result;

/// Derives the cache key from call arguments. `None` skips caching for
/// that call.
pub trait KeyExtractor<A>: Send + Sync {
    fn extract(&self, args: &A) -> Option<CacheKey>;
}

impl<A, F> KeyExtractor<A> for F
where
    F: Fn(&A) -> Option<CacheKey> + Send + Sync,
{
    fn extract(&self, args: &A) -> Option<CacheKey> {
        self(args)
    }
}

/// A read function served through the funnel.
pub struct Cached<A, T, K, F> {
    funnel: Arc<Funnel>,
    resource: String,
    extractor: K,
    func: F,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, K, F, Fut> Cached<A, T, K, F>
where
    T: Serialize + DeserializeOwned,
    K: KeyExtractor<A>,
    F: Fn(A) -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    pub fn new(funnel: Arc<Funnel>, resource: impl Into<String>, extractor: K, func: F) -> Self {
        Self {
            funnel,
            resource: resource.into(),
            extractor,
            func,
            _marker: PhantomData,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Call the wrapped function through the funnel.
    pub async fn call(&self, args: A) -> Result<Option<T>> {
        let Some(key) = self.extractor.extract(&args) else {
            debug!(resource = %self.resource, "No cache key, calling through");
            // An empty resource makes the funnel load directly
            let ctx = Context::new("", "");
            let value = self
                .funnel
                .handle_cache(&ctx, || self.load_json(args))
                .await?;
            return from_json(value);
        };

        let ctx = Context::new(self.resource.clone(), key);
        let value = self
            .funnel
            .handle_cache(&ctx, || self.load_json(args))
            .await?;
        from_json(value)
    }

    async fn load_json(&self, args: A) -> anyhow::Result<Option<serde_json::Value>> {
        match (self.func)(args).await? {
            Some(value) => Ok(Some(serde_json::to_value(value)?)),
            None => Ok(None),
        }
    }
}

fn from_json<T: DeserializeOwned>(value: Option<serde_json::Value>) -> Result<Option<T>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(Into::into)
}

/// A write function that evicts its key.
pub struct Evicted<A, K, F> {
    funnel: Arc<Funnel>,
    resource: String,
    extractor: K,
    timing: EvictTiming,
    delayed_delete: bool,
    broadcast: bool,
    func: F,
    _marker: PhantomData<fn(A)>,
}

impl<A, K, F, Fut, T, E> Evicted<A, K, F>
where
    K: KeyExtractor<A>,
    F: Fn(A) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    /// Evict after a successful write, with no delayed delete or broadcast.
    pub fn new(funnel: Arc<Funnel>, resource: impl Into<String>, extractor: K, func: F) -> Self {
        Self {
            funnel,
            resource: resource.into(),
            extractor,
            timing: EvictTiming::After,
            delayed_delete: false,
            broadcast: false,
            func,
            _marker: PhantomData,
        }
    }

    pub fn timing(mut self, timing: EvictTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn delayed_delete(mut self, enabled: bool) -> Self {
        self.delayed_delete = enabled;
        self
    }

    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// Call the wrapped write and evict its key.
    pub async fn call(&self, args: A) -> std::result::Result<T, E> {
        let Some(key) = self.extractor.extract(&args) else {
            debug!(resource = %self.resource, "No cache key, writing without eviction");
            return (self.func)(args).await;
        };

        let ctx = Context::new(self.resource.clone(), key);
        self.funnel
            .handle_evict(
                &ctx,
                self.timing,
                self.delayed_delete,
                self.broadcast,
                || (self.func)(args),
            )
            .await
    }
}
