//! Registry of named caches.
//!
//! Caches are created lazily per `(name, settings fingerprint)` and live as
//! long as the registry. Lookups are lock-free; creation is serialized by a
//! registry-wide mutex with a re-check under the lock. The first cache
//! created for a name subscribes the invalidation listener to that name's
//! channel.
//!
//! ## Multiple fingerprints per name
//!
//! By default a name may carry several fingerprints: each gets its own local
//! tier, they share remote keys, and an invalidation for the name applies to
//! all of them. This is logged as a warning since their TTLs disagree. With
//! `engine.strict_settings` a second fingerprint is rejected instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tiercache_store::DynStore;

use crate::config::{CacheSettings, EngineConfig, TierCacheConfig};
use crate::error::{CacheError, CacheResult};
use crate::layered::LayeredCache;
use crate::listener::{CacheTable, ListenerHandle, apply_invalidation};
use crate::message::InvalidationMessage;
use crate::refresh::RefreshExecutor;

struct RegistryInner {
    store: DynStore,
    config: TierCacheConfig,
    caches: Arc<CacheTable>,
    create_lock: Mutex<()>,
    refresher: RefreshExecutor,
    listener: ListenerHandle,
}

/// Owner of every cache instance of a process.
///
/// Cloning is cheap and clones share the same caches.
#[derive(Clone)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

impl CacheRegistry {
    /// Create a registry with default cache settings.
    ///
    /// Spawns the invalidation listener, so it must be called within a Tokio
    /// runtime. Fails with [`CacheError::Config`] if `engine` is invalid.
    pub fn new(store: DynStore, engine: EngineConfig) -> CacheResult<Self> {
        Self::from_config(
            store,
            TierCacheConfig {
                engine,
                ..Default::default()
            },
        )
    }

    /// Create a registry using `config` for engine tuning and per-name settings.
    pub fn from_config(store: DynStore, config: TierCacheConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        Ok(Self::build(store, config))
    }

    fn build(store: DynStore, config: TierCacheConfig) -> Self {
        let caches = Arc::new(CacheTable::new());
        let listener = ListenerHandle::spawn(store.clone(), caches.clone());
        Self {
            inner: Arc::new(RegistryInner {
                refresher: RefreshExecutor::new(config.engine.max_concurrent_refreshes),
                store,
                config,
                caches,
                create_lock: Mutex::new(()),
                listener,
            }),
        }
    }

    /// Connect to the store described by `config.redis` and build a registry.
    pub async fn connect(config: TierCacheConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        let store = tiercache_store::connect(&config.redis).await?;
        Ok(Self::build(store, config))
    }

    pub fn store(&self) -> &DynStore {
        &self.inner.store
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.inner.config.engine
    }

    pub fn config(&self) -> &TierCacheConfig {
        &self.inner.config
    }

    fn lookup(&self, name: &str, fingerprint: &str) -> Option<Arc<LayeredCache>> {
        let variants = self.inner.caches.get(name)?;
        variants.get(fingerprint).map(|cache| cache.value().clone())
    }

    /// Cache for `name` with `settings`, created on first use.
    pub fn get_cache(&self, name: &str, settings: &CacheSettings) -> CacheResult<Arc<LayeredCache>> {
        let fingerprint = settings.fingerprint();
        if let Some(cache) = self.lookup(name, &fingerprint) {
            return Ok(cache);
        }
        settings.validate().map_err(CacheError::InvalidSettings)?;

        let _guard = self.inner.create_lock.lock();
        if let Some(cache) = self.lookup(name, &fingerprint) {
            return Ok(cache);
        }

        let existing: Vec<String> = self
            .inner
            .caches
            .get(name)
            .map(|variants| variants.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default();
        if let Some(registered) = existing.first() {
            if self.inner.config.engine.strict_settings {
                return Err(CacheError::ConflictingSettings {
                    name: name.to_string(),
                    existing: registered.clone(),
                    requested: fingerprint,
                });
            }
            tracing::warn!(
                cache = %name,
                existing = ?existing,
                requested = %fingerprint,
                "cache name registered with multiple settings; invalidations apply to all of them"
            );
        }

        let cache = Arc::new(LayeredCache::new(
            name,
            settings.clone(),
            self.inner.store.clone(),
            &self.inner.config.engine,
            self.inner.refresher.clone(),
        ));
        self.inner
            .caches
            .entry(name.to_string())
            .or_default()
            .insert(fingerprint.clone(), cache.clone());
        tracing::info!(cache = %name, fingerprint = %fingerprint, "created cache");

        if existing.is_empty() {
            self.inner.listener.subscribe(name);
        }
        Ok(cache)
    }

    /// Cache for `name` with its configured settings, or the defaults.
    pub fn get_configured(&self, name: &str) -> CacheResult<Arc<LayeredCache>> {
        let settings = self.inner.config.settings_for(name).clone();
        self.get_cache(name, &settings)
    }

    /// Every settings variant registered under `name`.
    pub fn caches(&self, name: &str) -> Vec<Arc<LayeredCache>> {
        self.inner
            .caches
            .get(name)
            .map(|variants| variants.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Names of every registered cache, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .caches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Whether the listener is currently subscribed to `name`'s channel.
    pub fn is_listening(&self, name: &str) -> bool {
        self.inner.listener.is_listening(name)
    }

    /// Wait until the listener is subscribed to `name`'s channel.
    pub async fn wait_listening(&self, name: &str, timeout: Duration) -> bool {
        self.inner.listener.wait_listening(name, timeout).await
    }

    /// Apply an invalidation to this process's local tiers, as the listener does.
    pub async fn handle_message(&self, message: &InvalidationMessage) -> usize {
        apply_invalidation(&self.inner.caches, message).await
    }

    /// Stop the listener and wait for running refreshes.
    pub async fn shutdown(&self) {
        self.inner.listener.shutdown().await;
        self.inner.refresher.quiesce().await;
        tracing::info!("cache registry shut down");
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.cache_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tiercache_store::MemoryStore;

    use super::*;
    use crate::config::FirstTierSettings;

    fn registry(engine: EngineConfig) -> CacheRegistry {
        CacheRegistry::new(Arc::new(MemoryStore::new()), engine).unwrap()
    }

    fn variant(expire_ms: u64) -> CacheSettings {
        CacheSettings {
            first: FirstTierSettings {
                expire_ms,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_identity_returns_same_instance() {
        let registry = registry(EngineConfig::default());
        let a = registry.get_cache("users", &CacheSettings::default()).unwrap();
        let b = registry.get_cache("users", &CacheSettings::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cache_names(), vec!["users".to_string()]);
        assert!(registry.wait_listening("users", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_multiple_fingerprints_are_tolerated() {
        let registry = registry(EngineConfig::default());
        let a = registry.get_cache("users", &variant(1_000)).unwrap();
        let b = registry.get_cache("users", &variant(2_000)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.caches("users").len(), 2);
    }

    #[tokio::test]
    async fn test_strict_settings_rejects_second_fingerprint() {
        let registry = registry(EngineConfig {
            strict_settings: true,
            ..Default::default()
        });
        registry.get_cache("users", &variant(1_000)).unwrap();
        let err = registry.get_cache("users", &variant(2_000)).unwrap_err();
        assert!(matches!(err, CacheError::ConflictingSettings { .. }));
        assert_eq!(registry.caches("users").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_fast() {
        let registry = registry(EngineConfig::default());
        let mut settings = CacheSettings::default();
        settings.second.magnification = 5;
        let err = registry.get_cache("users", &settings).unwrap_err();
        assert!(matches!(err, CacheError::InvalidSettings(_)));
        assert!(registry.cache_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_engine_config_is_rejected() {
        let engine = EngineConfig {
            lock_ttl_ms: 0,
            ..Default::default()
        };
        let err = CacheRegistry::new(Arc::new(MemoryStore::new()), engine).unwrap_err();
        assert!(matches!(err, CacheError::Config(msg) if msg.contains("lock_ttl_ms")));

        let mut config = TierCacheConfig::default();
        let mut users = CacheSettings::default();
        users.second.preload_ms = users.second.expiration_ms;
        config.caches.insert("users".to_string(), users);
        let err = CacheRegistry::from_config(Arc::new(MemoryStore::new()), config).unwrap_err();
        assert!(matches!(err, CacheError::Config(msg) if msg.starts_with("caches.users")));
    }

    #[tokio::test]
    async fn test_get_configured_uses_named_settings() {
        let mut config = TierCacheConfig::default();
        config.caches.insert("users".to_string(), variant(4_000));
        let registry = CacheRegistry::from_config(Arc::new(MemoryStore::new()), config).unwrap();

        let users = registry.get_configured("users").unwrap();
        assert_eq!(users.settings().first.expire_ms, 4_000);
        let orders = registry.get_configured("orders").unwrap();
        assert_eq!(orders.settings(), &CacheSettings::default());
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_instance() {
        let registry = registry(EngineConfig::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_cache("users", &CacheSettings::default()).unwrap()
            }));
        }
        let mut caches = Vec::new();
        for handle in handles {
            caches.push(handle.await.unwrap());
        }
        assert!(caches.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn test_handle_message_clears_local_tiers() {
        let registry = registry(EngineConfig::default());
        let cache = registry.get_cache("users", &CacheSettings::default()).unwrap();
        cache.remote().put("1", Some(&1u32)).await.unwrap();
        cache.get::<u32>("1").await.unwrap();

        let touched = registry
            .handle_message(&InvalidationMessage::clear("users"))
            .await;
        assert_eq!(touched, 1);
        assert!(cache.local().unwrap().get::<u32>("1").await.unwrap().is_none());
        registry.shutdown().await;
    }
}
