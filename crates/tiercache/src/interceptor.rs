//! Read-through, write-through and eviction around caller functions.
//!
//! [`CacheInterceptor`] wraps a function call with cache operations against
//! one or more named caches. Keys are produced by the caller, either directly
//! or through a key closure on [`CachedFn`].
//!
//! ## Error policy
//!
//! - A value that cannot be decoded is evicted from every named cache before
//!   the error is handled.
//! - With `ignore_errors`, any other cache failure is logged and the function
//!   is called directly. Loader failures are always returned, since the
//!   function has already run.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheSettings;
use crate::error::{BoxError, CacheResult};
use crate::layered::LayeredCache;
use crate::loader::run_loader;
use crate::registry::CacheRegistry;

/// Which caches an intercepted call touches, and how failures are handled.
#[derive(Debug, Clone, Default)]
pub struct CacheOperation {
    /// Cache names. Reads use the first; writes and evictions use all.
    pub cache_names: Vec<String>,
    /// Settings for the caches. `None` uses the registry's configured settings.
    pub settings: Option<CacheSettings>,
    /// Call the function directly when a cache operation fails.
    pub ignore_errors: bool,
}

impl CacheOperation {
    pub fn new<I, S>(cache_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cache_names: cache_names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }
}

/// What an eviction removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictTarget {
    Key(String),
    AllEntries,
}

/// Applies [`CacheOperation`]s through a [`CacheRegistry`].
#[derive(Debug, Clone)]
pub struct CacheInterceptor {
    registry: CacheRegistry,
}

impl CacheInterceptor {
    pub fn new(registry: CacheRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    fn cache_for(&self, op: &CacheOperation, name: &str) -> CacheResult<Arc<LayeredCache>> {
        match &op.settings {
            Some(settings) => self.registry.get_cache(name, settings),
            None => self.registry.get_configured(name),
        }
    }

    /// Every registered variant of `name`, or a new one if none exists yet.
    fn variants_for(&self, op: &CacheOperation, name: &str) -> CacheResult<Vec<Arc<LayeredCache>>> {
        let caches = self.registry.caches(name);
        if caches.is_empty() {
            return Ok(vec![self.cache_for(op, name)?]);
        }
        Ok(caches)
    }

    /// Return the cached value for `key`, computing it with `loader` on a miss.
    ///
    /// Only the first cache name is consulted.
    pub async fn cacheable<T, F, Fut, E>(
        &self,
        op: &CacheOperation,
        key: &str,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let result = match op.cache_names.first() {
            Some(name) => match self.cache_for(op, name) {
                Ok(cache) => cache.get_with(key, loader.clone()).await,
                Err(e) => Err(e),
            },
            None => {
                tracing::warn!(key = %key, "cacheable operation without cache names");
                return run_loader(key, self.registry.engine().loader_timeout(), loader).await;
            }
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if err.is_serialization() {
            if let Err(evict_err) = self.evict_key(op, key).await {
                tracing::warn!(key = %key, error = %evict_err, "failed to evict undecodable value");
            }
        }
        if err.is_loader_failure() || !op.ignore_errors {
            return Err(err);
        }
        tracing::warn!(key = %key, error = %err, "cache read failed, calling loader directly");
        run_loader(key, self.registry.engine().loader_timeout(), loader).await
    }

    /// Run `loader` and write its result to every named cache.
    pub async fn put<T, F, Fut, E>(
        &self,
        op: &CacheOperation,
        key: &str,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        let value = run_loader(key, self.registry.engine().loader_timeout(), loader).await?;
        for name in &op.cache_names {
            let written = match self.cache_for(op, name) {
                Ok(cache) => cache.put(key, value.as_ref()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                if !op.ignore_errors {
                    return Err(e);
                }
                tracing::warn!(cache = %name, key = %key, error = %e, "cache write failed, ignoring");
            }
        }
        Ok(value)
    }

    /// Evict `target` from every variant of every named cache.
    pub async fn evict(&self, op: &CacheOperation, target: &EvictTarget) -> CacheResult<()> {
        let result = match target {
            EvictTarget::Key(key) => self.evict_key(op, key).await,
            EvictTarget::AllEntries => self.clear_all(op).await,
        };
        match result {
            Err(e) if op.ignore_errors => {
                tracing::warn!(evict = ?target, error = %e, "cache eviction failed, ignoring");
                Ok(())
            }
            other => other,
        }
    }

    async fn evict_key(&self, op: &CacheOperation, key: &str) -> CacheResult<()> {
        for name in &op.cache_names {
            for cache in self.variants_for(op, name)? {
                cache.evict(key).await?;
            }
        }
        Ok(())
    }

    async fn clear_all(&self, op: &CacheOperation) -> CacheResult<()> {
        for name in &op.cache_names {
            for cache in self.variants_for(op, name)? {
                cache.clear().await?;
            }
        }
        Ok(())
    }
}

/// A function whose results are cached under a key derived from its argument.
///
/// ```ignore
/// let find_user = CachedFn::new(
///     interceptor,
///     CacheOperation::new(["users"]),
///     |id: &u64| id.to_string(),
///     |id: u64| async move { repo.find(id).await },
/// );
/// let user = find_user.call(42).await?;
/// ```
pub struct CachedFn<A, T, K, L> {
    interceptor: CacheInterceptor,
    operation: CacheOperation,
    key_fn: K,
    loader: L,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, K, L, Fut, E> CachedFn<A, T, K, L>
where
    A: Clone + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    K: Fn(&A) -> String,
    L: Fn(A) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    pub fn new(interceptor: CacheInterceptor, operation: CacheOperation, key_fn: K, loader: L) -> Self {
        Self {
            interceptor,
            operation,
            key_fn,
            loader,
            _marker: PhantomData,
        }
    }

    pub fn operation(&self) -> &CacheOperation {
        &self.operation
    }

    /// Cached result for `arg`, calling the wrapped function on a miss.
    pub async fn call(&self, arg: A) -> CacheResult<Option<T>> {
        let key = (self.key_fn)(&arg);
        let loader = self.loader.clone();
        self.interceptor
            .cacheable(&self.operation, &key, move || loader(arg.clone()))
            .await
    }

    /// Call the wrapped function and overwrite the cached result for `arg`.
    pub async fn refresh(&self, arg: A) -> CacheResult<Option<T>> {
        let key = (self.key_fn)(&arg);
        let loader = self.loader.clone();
        self.interceptor
            .put(&self.operation, &key, move || loader(arg))
            .await
    }

    /// Drop the cached result for `arg`.
    pub async fn invalidate(&self, arg: &A) -> CacheResult<()> {
        let key = (self.key_fn)(arg);
        self.interceptor
            .evict(&self.operation, &EvictTarget::Key(key))
            .await
    }
}
