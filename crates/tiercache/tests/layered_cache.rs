//! Integration tests for the two-tier cache across instances.
//!
//! Each `CacheRegistry` stands in for one application instance; all of them
//! share a single `MemoryStore`, which plays the distributed tier and the
//! pub/sub bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tiercache::{
    CacheRegistry, CacheSettings, CacheValue, EngineConfig, FirstTierSettings, KeyTtl,
    LayeredCache, MemoryStore, SecondTierSettings,
};

const LISTEN_TIMEOUT: Duration = Duration::from_secs(2);

fn instance(store: &MemoryStore) -> CacheRegistry {
    CacheRegistry::new(Arc::new(store.clone()), EngineConfig::default()).expect("registry")
}

async fn cache(registry: &CacheRegistry, name: &str, settings: &CacheSettings) -> Arc<LayeredCache> {
    let cache = registry.get_cache(name, settings).expect("create cache");
    assert!(registry.wait_listening(name, LISTEN_TIMEOUT).await);
    cache
}

/// Poll until `key` is gone from `cache`'s in-process tier.
async fn wait_local_evicted(cache: &LayeredCache, key: &str) -> bool {
    let local = cache.local().expect("local tier");
    for _ in 0..100 {
        if local.get::<String>(key).await.unwrap().is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_put_on_one_instance_invalidates_the_others() {
    let store = MemoryStore::new();
    let (a, b) = (instance(&store), instance(&store));
    let settings = CacheSettings::default();
    let cache_a = cache(&a, "users", &settings).await;
    let cache_b = cache(&b, "users", &settings).await;

    cache_a.put("1", Some(&"v1".to_string())).await.unwrap();
    assert_eq!(cache_b.get::<String>("1").await.unwrap(), Some("v1".into()));
    // B now serves from its in-process tier.
    assert!(
        cache_b
            .local()
            .unwrap()
            .get::<String>("1")
            .await
            .unwrap()
            .is_some()
    );

    cache_a.put("1", Some(&"v2".to_string())).await.unwrap();
    assert!(wait_local_evicted(&cache_b, "1").await);
    assert_eq!(cache_b.get::<String>("1").await.unwrap(), Some("v2".into()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_evict_and_clear_propagate() {
    let store = MemoryStore::new();
    let (a, b) = (instance(&store), instance(&store));
    let settings = CacheSettings::default();
    let cache_a = cache(&a, "users", &settings).await;
    let cache_b = cache(&b, "users", &settings).await;

    for key in ["1", "2"] {
        cache_a.put(key, Some(&format!("v{key}"))).await.unwrap();
        cache_b.get::<String>(key).await.unwrap();
    }

    cache_a.evict("1").await.unwrap();
    assert!(wait_local_evicted(&cache_b, "1").await);
    assert_eq!(cache_b.lookup::<String>("1").await.unwrap(), CacheValue::Absent);

    cache_a.clear().await.unwrap();
    assert!(wait_local_evicted(&cache_b, "2").await);
    assert_eq!(cache_b.lookup::<String>("2").await.unwrap(), CacheValue::Absent);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_misses_across_instances_load_once() {
    let store = MemoryStore::new();
    let instances = [instance(&store), instance(&store), instance(&store)];
    let settings = CacheSettings::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut reads = Vec::new();
    for registry in &instances {
        let cache = registry.get_cache("users", &settings).unwrap();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            reads.push(async move {
                cache
                    .get_with("1", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, std::io::Error>(Some("loaded".to_string()))
                    })
                    .await
            });
        }
    }

    for result in join_all(reads).await {
        assert_eq!(result.unwrap(), Some("loaded".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats: u64 = instances
        .iter()
        .flat_map(|registry| registry.caches("users"))
        .map(|cache| cache.stats().loads)
        .sum();
    assert_eq!(stats, 1);
}

#[tokio::test]
async fn test_null_results_are_cached_with_shorter_ttl() {
    let store = MemoryStore::new();
    let registry = instance(&store);
    let settings = CacheSettings {
        second: SecondTierSettings {
            expiration_ms: 10_000,
            preload_ms: 1_000,
            allow_null: true,
            magnification: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache = cache(&registry, "users", &settings).await;
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let value = cache
            .get_with("missing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<String>, std::io::Error>(None)
            })
            .await
            .unwrap();
        assert_eq!(value, None);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache.lookup::<String>("missing").await.unwrap(),
        CacheValue::PresentNull
    );
    // Nulls never reach the in-process tier.
    assert!(cache.local().unwrap().get::<String>("missing").await.unwrap().is_none());

    match cache.ttl("missing").await.unwrap() {
        KeyTtl::Expires(remaining) => assert!(remaining <= Duration::from_secs(2)),
        other => panic!("unexpected ttl {other:?}"),
    }
}

#[tokio::test]
async fn test_nulls_disallowed_are_not_cached() {
    let store = MemoryStore::new();
    let registry = instance(&store);
    let cache = cache(&registry, "users", &CacheSettings::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        cache
            .get_with("missing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<String>, std::io::Error>(None)
            })
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.ttl("missing").await.unwrap(), KeyTtl::Missing);
}

/// Local tier expires after 800ms, remote after 2s, refresh window 800ms.
#[tokio::test]
async fn test_hard_refresh_scenario() {
    let store = MemoryStore::new();
    let (a, b) = (instance(&store), instance(&store));
    let settings = CacheSettings {
        first: FirstTierSettings {
            expire_ms: 800,
            ..Default::default()
        },
        second: SecondTierSettings {
            expiration_ms: 2_000,
            preload_ms: 800,
            force_refresh: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache_a = cache(&a, "scenario", &settings).await;
    let cache_b = cache(&b, "scenario", &settings).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let loader = {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, std::io::Error>(Some(format!("v{n}"))) }
        }
    };

    // t=0: stored.
    assert_eq!(cache_a.get_with("k", loader.clone()).await.unwrap(), Some("v1".into()));

    // t=1.0s: local expired, remote has ~1s left (outside the window).
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(cache_a.get_with("k", loader.clone()).await.unwrap(), Some("v1".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // t=1.4s: ~600ms left, inside the window. The read still returns v1.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache_b.get_with("k", loader.clone()).await.unwrap(), Some("v1".into()));

    let mut refreshed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if cache_b.remote().get::<String>("k").await.unwrap() == Some("v2".into()) {
            refreshed = true;
            break;
        }
    }
    assert!(refreshed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match cache_b.ttl("k").await.unwrap() {
        KeyTtl::Expires(remaining) => assert!(remaining > Duration::from_millis(1_200)),
        other => panic!("unexpected ttl {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_soft_refresh_extends_ttl_without_loading() {
    let store = MemoryStore::new();
    let registry = instance(&store);
    let settings = CacheSettings {
        use_first_tier: false,
        second: SecondTierSettings {
            expiration_ms: 1_000,
            preload_ms: 600,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache = cache(&registry, "soft", &settings).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, std::io::Error>(Some(1u32)) }
        }
    };

    cache.get_with("k", loader.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    cache.get_with("k", loader.clone()).await.unwrap();

    match cache.ttl("k").await.unwrap() {
        KeyTtl::Expires(remaining) => assert!(remaining > Duration::from_millis(700)),
        other => panic!("unexpected ttl {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().soft_refreshes, 1);
}
