//! Distributed tier.
//!
//! Owns stampede protection and the refresh protocol:
//!
//! - A miss goes through a lock-serialized load. Up to `load_retry_count`
//!   times the task re-reads the key, tries the `<key>_sync_lock` lock, and
//!   otherwise parks on the wait coordinator for `load_wait_ms`. When the
//!   budget runs out the loader is called without the lock, trading a
//!   possible duplicate load for bounded latency.
//! - A hit whose remaining TTL is inside the preload window is refreshed:
//!   softly (TTL reset under `<key>_lock`) or, with `force_refresh`, by
//!   reloading the value in the background while the read returns the old one.
//! - Cached nulls get `expiration / magnification` as TTL and
//!   `preload / magnification` as refresh window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_store::{DynStore, KeyTtl};

use crate::config::{EngineConfig, SecondTierSettings};
use crate::error::{BoxError, CacheResult};
use crate::loader::run_loader;
use crate::metrics::{LoadOutcome, RefreshMode, Tier};
use crate::refresh::RefreshExecutor;
use crate::stats::{CacheStats, StatsCounters};
use crate::sync::{DistributedLock, LockHandle, WaitCoordinator};
use crate::value::{CacheValue, StoredValue, ValueAdapter};

/// Suffix of the lock serializing loads of a missing key.
pub const LOAD_LOCK_SUFFIX: &str = "_sync_lock";

/// Suffix of the lock serializing refreshes of a present key.
pub const REFRESH_LOCK_SUFFIX: &str = "_lock";

/// Value produced by a read-through load, with its stored form.
pub(crate) struct Fetched<T> {
    pub(crate) value: Option<T>,
    /// `None` when nothing was stored (a null with nulls disallowed).
    pub(crate) stored: Option<StoredValue>,
}

enum LoadSlot {
    /// The key appeared while waiting.
    Found(StoredValue),
    /// This task holds the load lock.
    Locked(LockHandle),
    /// Retry budget exhausted.
    Exhausted,
}

struct RemoteInner {
    name: String,
    settings: SecondTierSettings,
    adapter: ValueAdapter,
    store: DynStore,
    engine: EngineConfig,
    waits: WaitCoordinator,
    refresher: RefreshExecutor,
    stats: Arc<StatsCounters>,
}

/// View of one named cache in the distributed store.
#[derive(Clone)]
pub struct RemoteTier {
    inner: Arc<RemoteInner>,
}

impl RemoteTier {
    pub fn new(
        name: impl Into<String>,
        settings: SecondTierSettings,
        store: DynStore,
        engine: EngineConfig,
        refresher: RefreshExecutor,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(RemoteInner {
                adapter: ValueAdapter::new(settings.allow_null),
                stats: Arc::new(StatsCounters::new(name.clone())),
                name,
                settings,
                store,
                engine,
                waits: WaitCoordinator::new(),
                refresher,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &SecondTierSettings {
        &self.inner.settings
    }

    pub fn adapter(&self) -> ValueAdapter {
        self.inner.adapter
    }

    pub(crate) fn counters(&self) -> &Arc<StatsCounters> {
        &self.inner.stats
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(0)
    }

    /// Key under which `key` is stored: `<name>:<key>` with prefixing enabled.
    pub fn store_key(&self, key: &str) -> String {
        if self.inner.settings.use_prefix {
            format!("{}:{}", self.inner.name, key)
        } else {
            key.to_string()
        }
    }

    fn ttl_for(&self, stored: &StoredValue) -> Duration {
        if stored.is_null() {
            self.inner.settings.null_expiration()
        } else {
            self.inner.settings.expiration()
        }
    }

    fn preload_for(&self, stored: &StoredValue) -> Duration {
        if stored.is_null() && self.inner.adapter.allow_null() {
            self.inner.settings.null_preload()
        } else {
            self.inner.settings.preload()
        }
    }

    fn lock(&self, store_key: &str, suffix: &str) -> DistributedLock {
        DistributedLock::new(
            self.inner.store.clone(),
            format!("{store_key}{suffix}"),
            self.inner.engine.lock_ttl(),
        )
        .with_acquire_timeout(self.inner.engine.lock_acquire_timeout())
    }

    async fn read(&self, key: &str, store_key: &str) -> CacheResult<Option<StoredValue>> {
        match self.inner.store.get(store_key).await? {
            Some(bytes) => Ok(Some(StoredValue::from_bytes(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply the TTL policy and write `stored`; `None` (a null that may not
    /// be cached) deletes the key instead.
    async fn write_stored(
        &self,
        store_key: &str,
        stored: Option<StoredValue>,
    ) -> CacheResult<Option<StoredValue>> {
        match stored {
            None => {
                self.inner.store.delete(store_key).await?;
                Ok(None)
            }
            Some(stored) => {
                let ttl = self.ttl_for(&stored);
                self.inner
                    .store
                    .set_with_ttl(store_key, &stored.to_bytes(), ttl)
                    .await?;
                Ok(Some(stored))
            }
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(
        &self,
        key: &str,
        stored: &StoredValue,
    ) -> CacheResult<CacheValue<T>> {
        self.inner.adapter.from_stored(key, stored)
    }

    /// Single store read, stored form.
    pub(crate) async fn lookup_stored(&self, key: &str) -> CacheResult<Option<StoredValue>> {
        let store_key = self.store_key(key);
        let stored = self.read(key, &store_key).await?;
        match &stored {
            Some(_) => self.inner.stats.hit(Tier::Remote),
            None => self.inner.stats.miss(),
        }
        Ok(stored)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        Ok(self.lookup(key).await?.into_option())
    }

    /// Single store read distinguishing a cached null from a missing key.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<CacheValue<T>> {
        match self.lookup_stored(key).await? {
            Some(stored) => self.decode(key, &stored),
            None => Ok(CacheValue::Absent),
        }
    }

    /// Read `key`, loading it with `loader` on a miss under stampede protection.
    ///
    /// A hit inside the refresh window triggers a soft or hard refresh; the
    /// returned value is always the one read.
    pub async fn get_with<T, F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Ok(self.fetch_with(key, loader).await?.value)
    }

    pub(crate) async fn fetch_with<T, F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> CacheResult<Fetched<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let store_key = self.store_key(key);
        if let Some(stored) = self.read(key, &store_key).await? {
            self.inner.stats.hit(Tier::Remote);
            tracing::debug!(cache = %self.inner.name, key = %store_key, "remote hit");
            self.refresh_if_due(key, &store_key, &stored, loader).await;
            return self.fetched(key, stored);
        }
        self.inner.stats.miss();

        match self.acquire_load_slot(key, &store_key).await? {
            LoadSlot::Found(stored) => self.fetched(key, stored),
            LoadSlot::Locked(handle) => {
                let result = self.load_and_store(key, &store_key, loader).await;
                self.inner.waits.signal_all(&store_key);
                release(handle).await;
                self.record_load(&result, LoadOutcome::Locked);
                result
            }
            LoadSlot::Exhausted => {
                tracing::debug!(
                    cache = %self.inner.name,
                    key = %store_key,
                    retries = self.inner.engine.load_retry_count,
                    "load lock not acquired, loading without it"
                );
                let result = self.load_and_store(key, &store_key, loader).await;
                self.record_load(&result, LoadOutcome::Fallback);
                result
            }
        }
    }

    fn fetched<T: DeserializeOwned>(&self, key: &str, stored: StoredValue) -> CacheResult<Fetched<T>> {
        let value = self.decode(key, &stored)?.into_option();
        Ok(Fetched {
            value,
            stored: Some(stored),
        })
    }

    fn record_load<T>(&self, result: &CacheResult<T>, outcome: LoadOutcome) {
        match result {
            Ok(_) => self.inner.stats.load(outcome),
            Err(_) => self.inner.stats.load(LoadOutcome::Failed),
        }
    }

    async fn acquire_load_slot(&self, key: &str, store_key: &str) -> CacheResult<LoadSlot> {
        let lock = self.lock(store_key, LOAD_LOCK_SUFFIX);
        let wait = self.inner.engine.load_wait();
        for attempt in 0..self.inner.engine.load_retry_count {
            // Another task or process may have populated the key meanwhile.
            if let Some(stored) = self.read(key, store_key).await? {
                tracing::debug!(key = %store_key, attempt, "value loaded elsewhere");
                return Ok(LoadSlot::Found(stored));
            }
            if let Some(handle) = lock.try_acquire().await? {
                return Ok(LoadSlot::Locked(handle));
            }
            tracing::trace!(key = %store_key, attempt, wait = ?wait, "load lock busy, waiting");
            self.inner.waits.wait(store_key, wait).await;
        }
        Ok(LoadSlot::Exhausted)
    }

    async fn load_and_store<T, F, Fut, E>(
        &self,
        key: &str,
        store_key: &str,
        loader: F,
    ) -> CacheResult<Fetched<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        let started = tokio::time::Instant::now();
        let value = run_loader(key, self.inner.engine.loader_timeout(), loader).await?;
        // Encode before the write so no borrow of the value spans an await.
        let stored = self.inner.adapter.to_stored(key, value.as_ref())?;
        let stored = self.write_stored(store_key, stored).await?;
        tracing::debug!(
            cache = %self.inner.name,
            key = %store_key,
            null = value.is_none(),
            elapsed = ?started.elapsed(),
            "loaded value"
        );
        Ok(Fetched { value, stored })
    }

    async fn refresh_if_due<T, F, Fut, E>(
        &self,
        key: &str,
        store_key: &str,
        stored: &StoredValue,
        loader: F,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let window = self.preload_for(stored);
        let remaining = match self.inner.store.ttl(store_key).await {
            Ok(ttl) => ttl.remaining(),
            Err(e) => {
                tracing::warn!(key = %store_key, error = %e, "failed to read TTL for refresh check");
                return;
            }
        };
        let Some(remaining) = remaining else {
            return;
        };
        if remaining.is_zero() || remaining > window {
            return;
        }

        if self.inner.settings.force_refresh {
            tracing::debug!(key = %store_key, remaining = ?remaining, "scheduling hard refresh");
            self.schedule_hard_refresh(key, store_key, window, loader);
        } else {
            tracing::debug!(key = %store_key, remaining = ?remaining, "soft refresh");
            self.soft_refresh(store_key, stored).await;
        }
    }

    async fn soft_refresh(&self, store_key: &str, stored: &StoredValue) {
        let lock = self.lock(store_key, REFRESH_LOCK_SUFFIX);
        let handle = match lock.try_acquire().await {
            Ok(Some(handle)) => handle,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(key = %store_key, error = %e, "soft refresh lock failed");
                return;
            }
        };
        match self.inner.store.expire(store_key, self.ttl_for(stored)).await {
            Ok(true) => self.inner.stats.refresh(RefreshMode::Soft),
            Ok(false) => tracing::debug!(key = %store_key, "key expired before soft refresh"),
            Err(e) => tracing::warn!(key = %store_key, error = %e, "soft refresh failed"),
        }
        release(handle).await;
    }

    fn schedule_hard_refresh<T, F, Fut, E>(
        &self,
        key: &str,
        store_key: &str,
        window: Duration,
        loader: F,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let tier = self.clone();
        let key = key.to_string();
        let task_key = store_key.to_string();
        self.inner.refresher.submit(&self.inner.name, store_key, async move {
            if let Err(e) = tier.hard_refresh(&key, &task_key, window, loader).await {
                tracing::warn!(cache = %tier.inner.name, key = %task_key, error = %e, "hard refresh failed");
            }
        });
    }

    async fn hard_refresh<T, F, Fut, E>(
        &self,
        key: &str,
        store_key: &str,
        window: Duration,
        loader: F,
    ) -> CacheResult<()>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        let Some(handle) = self.lock(store_key, REFRESH_LOCK_SUFFIX).acquire().await? else {
            tracing::debug!(key = %store_key, "refresh lock busy, skipping hard refresh");
            return Ok(());
        };
        let result = self.reload_if_due(key, store_key, window, loader).await;
        release(handle).await;
        result
    }

    async fn reload_if_due<T, F, Fut, E>(
        &self,
        key: &str,
        store_key: &str,
        window: Duration,
        loader: F,
    ) -> CacheResult<()>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        // Another process may have refreshed while the lock was contended.
        let due = matches!(
            self.inner.store.ttl(store_key).await?,
            KeyTtl::Expires(remaining) if !remaining.is_zero() && remaining <= window
        );
        if !due {
            tracing::debug!(key = %store_key, "already refreshed elsewhere");
            return Ok(());
        }
        self.load_and_store(key, store_key, loader).await?;
        self.inner.stats.refresh(RefreshMode::Hard);
        Ok(())
    }

    /// Write `value` with the TTL policy; `None` is a cached null or a delete.
    pub async fn put<T: Serialize>(&self, key: &str, value: Option<&T>) -> CacheResult<()> {
        let store_key = self.store_key(key);
        let stored = self.inner.adapter.to_stored(key, value)?;
        self.write_stored(&store_key, stored).await?;
        tracing::debug!(cache = %self.inner.name, key = %store_key, "remote put");
        Ok(())
    }

    /// Write `value` unless the key exists.
    ///
    /// Returns the existing entry, or [`CacheValue::Absent`] if nothing was there.
    pub async fn put_if_absent<T>(&self, key: &str, value: Option<&T>) -> CacheResult<CacheValue<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let store_key = self.store_key(key);
        let Some(stored) = self.inner.adapter.to_stored(key, value)? else {
            // Nothing to write; report what is there.
            return match self.read(key, &store_key).await? {
                Some(existing) => self.decode(key, &existing),
                None => Ok(CacheValue::Absent),
            };
        };
        let written = self
            .inner
            .store
            .set_if_absent(&store_key, &stored.to_bytes(), self.ttl_for(&stored))
            .await?;
        if written {
            return Ok(CacheValue::Absent);
        }
        match self.read(key, &store_key).await? {
            Some(existing) => self.decode(key, &existing),
            None => Ok(CacheValue::Absent),
        }
    }

    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        let store_key = self.store_key(key);
        self.inner.store.delete(&store_key).await?;
        tracing::info!(cache = %self.inner.name, key = %store_key, "evicted remote entry");
        Ok(())
    }

    /// Delete every key under this cache's prefix. Returns how many were deleted.
    ///
    /// Without prefixing the keys of this cache cannot be told apart from
    /// others, so this is a no-op returning 0.
    pub async fn clear(&self) -> CacheResult<u64> {
        if !self.inner.settings.use_prefix {
            tracing::warn!(cache = %self.inner.name, "clear ignored: use_prefix is disabled");
            return Ok(0);
        }
        let prefix = format!("{}:", self.inner.name);
        let keys = self.inner.store.scan_prefix(&prefix).await?;
        let removed = self.inner.store.delete_many(&keys).await?;
        tracing::info!(cache = %self.inner.name, removed, "cleared remote entries");
        Ok(removed)
    }

    /// Remaining lifetime of `key`.
    pub async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        Ok(self.inner.store.ttl(&self.store_key(key)).await?)
    }
}

impl std::fmt::Debug for RemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTier")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

async fn release(handle: LockHandle) {
    let key = handle.key().to_string();
    if let Err(e) = handle.release().await {
        tracing::warn!(lock = %key, error = %e, "failed to release lock");
    }
}
