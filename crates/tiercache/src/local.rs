//! In-process tier.
//!
//! A bounded moka cache of encoded payloads. Nulls are never stored here: a
//! cached null lives only in the distributed tier, where its TTL is governed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{ExpireMode, FirstTierSettings};
use crate::error::{BoxError, CacheResult};
use crate::loader::run_loader;
use crate::value::{CacheValue, decode, encode};

/// Bounded, time-expiring in-process cache.
#[derive(Clone)]
pub struct LocalTier {
    name: String,
    cache: Cache<String, Arc<Vec<u8>>>,
    loader_timeout: Duration,
}

impl LocalTier {
    pub fn new(name: impl Into<String>, settings: &FirstTierSettings, loader_timeout: Duration) -> Self {
        let name = name.into();
        let builder = Cache::builder()
            .name(&name)
            .initial_capacity(settings.initial_capacity)
            .max_capacity(settings.maximum_size);
        let builder = match settings.expire_mode {
            ExpireMode::AfterWrite => builder.time_to_live(settings.expire()),
            ExpireMode::AfterAccess => builder.time_to_idle(settings.expire()),
        };
        Self {
            name,
            cache: builder.build(),
            loader_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn get_raw(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.cache.get(key).await
    }

    pub(crate) async fn put_raw(&self, key: &str, payload: Arc<Vec<u8>>) {
        self.cache.insert(key.to_string(), payload).await;
    }

    /// Insert unless an entry exists. Returns `true` if inserted.
    pub(crate) async fn put_raw_if_absent(&self, key: &str, payload: Arc<Vec<u8>>) -> bool {
        self.cache
            .entry(key.to_string())
            .or_insert_with(async move { payload })
            .await
            .is_fresh()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        Ok(self.lookup(key).await?.into_option())
    }

    /// Typed lookup. Never returns [`CacheValue::PresentNull`].
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<CacheValue<T>> {
        match self.get_raw(key).await {
            Some(payload) => Ok(CacheValue::Present(decode(key, &payload)?)),
            None => Ok(CacheValue::Absent),
        }
    }

    /// Read `key`, computing it with `loader` on a miss.
    ///
    /// Concurrent misses in this process may each run the loader. A loader
    /// returning `None` leaves no entry behind.
    pub async fn get_with<T, F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        if let Some(payload) = self.get_raw(key).await {
            return Ok(Some(decode(key, &payload)?));
        }
        let value = run_loader(key, self.loader_timeout, loader).await?;
        if let Some(value) = &value {
            self.put_raw(key, Arc::new(encode(key, value)?)).await;
        }
        Ok(value)
    }

    /// Write `value`; `None` removes the entry.
    pub async fn put<T: Serialize>(&self, key: &str, value: Option<&T>) -> CacheResult<()> {
        match value {
            Some(value) => self.put_raw(key, Arc::new(encode(key, value)?)).await,
            None => self.evict(key).await,
        }
        Ok(())
    }

    /// Write `value` unless an entry exists. Returns the existing entry, or
    /// [`CacheValue::Absent`] if `value` was written.
    pub async fn put_if_absent<T>(&self, key: &str, value: &T) -> CacheResult<CacheValue<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = Arc::new(encode(key, value)?);
        let entry = self
            .cache
            .entry(key.to_string())
            .or_insert_with(async move { payload })
            .await;
        if entry.is_fresh() {
            Ok(CacheValue::Absent)
        } else {
            Ok(CacheValue::Present(decode(key, entry.value())?))
        }
    }

    pub async fn evict(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions so [`entry_count`](Self::entry_count) is exact.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
