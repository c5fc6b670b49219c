//! Composite two-tier cache.
//!
//! Reads go local first, then remote, and backfill the local tier with
//! `put_if_absent` so a concurrent local write is never overwritten. Writes
//! and evictions go to the remote tier first, then drop the local copy and
//! broadcast an invalidation so every other process drops its copy too. New
//! values are never written straight into a local tier: each process
//! re-derives its local copy from the remote tier on its next read.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_store::{DynStore, KeyTtl};

use crate::config::{CacheSettings, EngineConfig};
use crate::error::{BoxError, CacheResult};
use crate::local::LocalTier;
use crate::message::{InvalidationMessage, publish_invalidation};
use crate::metrics::Tier;
use crate::refresh::RefreshExecutor;
use crate::remote::RemoteTier;
use crate::stats::CacheStats;
use crate::value::{CacheValue, StoredValue, decode};

/// One named cache: an optional in-process tier in front of a remote tier.
pub struct LayeredCache {
    name: String,
    settings: CacheSettings,
    fingerprint: String,
    local: Option<LocalTier>,
    remote: RemoteTier,
    store: DynStore,
}

impl LayeredCache {
    pub fn new(
        name: impl Into<String>,
        settings: CacheSettings,
        store: DynStore,
        engine: &EngineConfig,
        refresher: RefreshExecutor,
    ) -> Self {
        let name = name.into();
        let local = settings
            .use_first_tier
            .then(|| LocalTier::new(name.clone(), &settings.first, engine.loader_timeout()));
        let remote = RemoteTier::new(
            name.clone(),
            settings.second.clone(),
            store.clone(),
            engine.clone(),
            refresher,
        );
        Self {
            fingerprint: settings.fingerprint(),
            name,
            settings,
            local,
            remote,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn local(&self) -> Option<&LocalTier> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> &RemoteTier {
        &self.remote
    }

    pub fn stats(&self) -> CacheStats {
        let local_entries = self.local.as_ref().map_or(0, LocalTier::entry_count);
        self.remote.counters().snapshot(local_entries)
    }

    async fn local_hit(&self, key: &str) -> Option<std::sync::Arc<Vec<u8>>> {
        let payload = self.local.as_ref()?.get_raw(key).await?;
        self.remote.counters().hit(Tier::Local);
        tracing::debug!(cache = %self.name, key = %key, "local hit");
        Some(payload)
    }

    async fn backfill(&self, key: &str, stored: &StoredValue) {
        // Nulls stay remote-only.
        if let (Some(local), Some(payload)) = (&self.local, stored.payload()) {
            local.put_raw_if_absent(key, payload.clone()).await;
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        Ok(self.lookup(key).await?.into_option())
    }

    /// Read `key` from either tier, distinguishing a cached null from a miss.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<CacheValue<T>> {
        if let Some(payload) = self.local_hit(key).await {
            return Ok(CacheValue::Present(decode(key, &payload)?));
        }
        let Some(stored) = self.remote.lookup_stored(key).await? else {
            return Ok(CacheValue::Absent);
        };
        let value = self.remote.decode(key, &stored)?;
        self.backfill(key, &stored).await;
        Ok(value)
    }

    /// Read `key`, loading it with `loader` on a miss.
    ///
    /// A local hit never touches the remote tier. Otherwise the remote tier's
    /// stampede-protected load runs and the result is backfilled locally.
    pub async fn get_with<T, F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if let Some(payload) = self.local_hit(key).await {
            return Ok(Some(decode(key, &payload)?));
        }
        let fetched = self.remote.fetch_with(key, loader).await?;
        if let Some(stored) = &fetched.stored {
            self.backfill(key, stored).await;
        }
        Ok(fetched.value)
    }

    /// Write through to the remote tier and invalidate local copies.
    pub async fn put<T: Serialize>(&self, key: &str, value: Option<&T>) -> CacheResult<()> {
        self.remote.put(key, value).await?;
        self.invalidate_key(key).await
    }

    /// Write to the remote tier unless the key exists there, then invalidate
    /// local copies. Returns the existing remote entry, or
    /// [`CacheValue::Absent`] if `value` was written.
    pub async fn put_if_absent<T>(&self, key: &str, value: Option<&T>) -> CacheResult<CacheValue<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let previous = self.remote.put_if_absent(key, value).await?;
        self.invalidate_key(key).await?;
        Ok(previous)
    }

    /// Evict from the remote tier, then from every local tier.
    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        self.remote.evict(key).await?;
        self.invalidate_key(key).await
    }

    /// Clear the remote tier (prefixed caches only), then every local tier.
    pub async fn clear(&self) -> CacheResult<()> {
        self.remote.clear().await?;
        let Some(local) = &self.local else {
            return Ok(());
        };
        local.clear();
        publish_invalidation(self.store.as_ref(), &InvalidationMessage::clear(&self.name)).await
    }

    async fn invalidate_key(&self, key: &str) -> CacheResult<()> {
        let Some(local) = &self.local else {
            return Ok(());
        };
        local.evict(key).await;
        publish_invalidation(self.store.as_ref(), &InvalidationMessage::evict(&self.name, key))
            .await
    }

    /// Drop `key` from the in-process tier only.
    pub async fn evict_local(&self, key: &str) {
        if let Some(local) = &self.local {
            local.evict(key).await;
        }
    }

    /// Drop every entry of the in-process tier only.
    pub fn clear_local(&self) {
        if let Some(local) = &self.local {
            local.clear();
        }
    }

    /// Remaining remote lifetime of `key`.
    pub async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.remote.ttl(key).await
    }
}

impl std::fmt::Debug for LayeredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("use_first_tier", &self.local.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tiercache_store::{DistributedStore, MemoryStore};

    use super::*;
    use crate::message::InvalidationKind;

    fn cache(store: &MemoryStore, settings: CacheSettings) -> LayeredCache {
        LayeredCache::new(
            "users",
            settings,
            Arc::new(store.clone()),
            &EngineConfig::default(),
            RefreshExecutor::new(4),
        )
    }

    #[tokio::test]
    async fn test_get_with_backfills_local() {
        let store = MemoryStore::new();
        let cache = cache(&store, CacheSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let value = cache
            .get_with("1", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Some("ada".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("ada"));

        // Served locally even after the remote entry is gone.
        store.delete("users:1").await.unwrap();
        let value: Option<String> = cache.get("1").await.unwrap();
        assert_eq!(value.as_deref(), Some("ada"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_lookup_reads_remote_and_backfills() {
        let store = MemoryStore::new();
        let writer = cache(&store, CacheSettings::default());
        let reader = cache(&store, CacheSettings::default());

        writer.remote().put("1", Some(&7u32)).await.unwrap();
        assert_eq!(reader.lookup::<u32>("1").await.unwrap(), CacheValue::Present(7));
        assert_eq!(
            reader.local().unwrap().get::<u32>("1").await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_cached_null_is_not_backfilled() {
        let store = MemoryStore::new();
        let mut settings = CacheSettings::default();
        settings.second.allow_null = true;
        let cache = cache(&store, settings);

        let value: Option<String> = cache
            .get_with("1", || async { Ok::<_, std::io::Error>(None) })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(
            cache.lookup::<String>("1").await.unwrap(),
            CacheValue::PresentNull
        );
        assert!(cache.local().unwrap().get::<String>("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_invalidates_and_broadcasts() {
        let store = MemoryStore::new();
        let cache = cache(&store, CacheSettings::default());
        let mut subscriber = store.subscriber().await.unwrap();
        subscriber.subscribe("users").await.unwrap();

        cache.put("1", Some(&1u32)).await.unwrap();
        assert_eq!(cache.get::<u32>("1").await.unwrap(), Some(1));

        cache.put("1", Some(&2u32)).await.unwrap();
        assert!(cache.local().unwrap().get::<u32>("1").await.unwrap().is_none());
        assert_eq!(cache.get::<u32>("1").await.unwrap(), Some(2));

        let message = subscriber.next_message().await.unwrap().unwrap();
        let message = InvalidationMessage::from_bytes(&message.payload).unwrap();
        assert_eq!(message, InvalidationMessage::evict("users", "1"));
    }

    #[tokio::test]
    async fn test_evict_removes_remote_before_broadcast() {
        let store = MemoryStore::new();
        let cache = cache(&store, CacheSettings::default());
        cache.put("1", Some(&1u32)).await.unwrap();

        let mut subscriber = store.subscriber().await.unwrap();
        subscriber.subscribe("users").await.unwrap();
        cache.evict("1").await.unwrap();

        let message = subscriber.next_message().await.unwrap().unwrap();
        let message = InvalidationMessage::from_bytes(&message.payload).unwrap();
        assert_eq!(message.kind, InvalidationKind::Evict);
        assert!(store.get("users:1").await.unwrap().is_none());
        assert_eq!(cache.get::<u32>("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_broadcasts_clear() {
        let store = MemoryStore::new();
        let cache = cache(&store, CacheSettings::default());
        cache.put("1", Some(&1u32)).await.unwrap();
        cache.get::<u32>("1").await.unwrap();

        let mut subscriber = store.subscriber().await.unwrap();
        subscriber.subscribe("users").await.unwrap();
        cache.clear().await.unwrap();

        let message = subscriber.next_message().await.unwrap().unwrap();
        let message = InvalidationMessage::from_bytes(&message.payload).unwrap();
        assert_eq!(message, InvalidationMessage::clear("users"));
        assert_eq!(cache.get::<u32>("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_without_first_tier() {
        let store = MemoryStore::new();
        let settings = CacheSettings {
            use_first_tier: false,
            ..Default::default()
        };
        let cache = cache(&store, settings);
        assert!(cache.local().is_none());

        cache.put("1", Some(&1u32)).await.unwrap();
        assert_eq!(cache.get::<u32>("1").await.unwrap(), Some(1));
        assert_eq!(cache.stats().remote_hits, 1);
        assert_eq!(cache.stats().local_hits, 0);
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_remote_value() {
        let store = MemoryStore::new();
        let cache = cache(&store, CacheSettings::default());

        assert_eq!(
            cache.put_if_absent("1", Some(&1u32)).await.unwrap(),
            CacheValue::Absent
        );
        assert_eq!(
            cache.put_if_absent("1", Some(&2u32)).await.unwrap(),
            CacheValue::Present(1)
        );
        assert_eq!(cache.get::<u32>("1").await.unwrap(), Some(1));
    }
}
