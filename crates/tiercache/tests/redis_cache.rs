//! Integration tests against a real Redis.
//!
//! These tests verify:
//! - The store primitives the engine relies on (TTL, set-if-absent, compare-and-delete, scans)
//! - The owner-token lock across holders
//! - Cross-instance invalidation over Redis pub/sub
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache::{
    CacheRegistry, CacheSettings, DistributedLock, DistributedStore, DynStore, EngineConfig,
    KeyTtl, RedisConfig, RedisStore,
};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn connect() -> DynStore {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 5,
        timeout_ms: 5000,
    };
    tiercache_store::connect(&config).await.expect("connect to redis")
}

#[tokio::test]
async fn test_redis_store_get_set_ttl() {
    let store = connect().await;

    store
        .set_with_ttl("it:get_set", b"value", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.get("it:get_set").await.unwrap(), Some(b"value".to_vec()));

    match store.ttl("it:get_set").await.unwrap() {
        KeyTtl::Expires(remaining) => {
            assert!(remaining <= Duration::from_secs(60));
            assert!(remaining > Duration::from_secs(50));
        }
        other => panic!("unexpected ttl {other:?}"),
    }
    assert!(store.expire("it:get_set", Duration::from_secs(5)).await.unwrap());
    assert!(store.ttl("it:get_set").await.unwrap().remaining().unwrap() <= Duration::from_secs(5));

    assert!(store.delete("it:get_set").await.unwrap());
    assert_eq!(store.ttl("it:get_set").await.unwrap(), KeyTtl::Missing);
    assert!(!store.expire("it:get_set", Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
async fn test_redis_store_set_if_absent_and_compare_delete() {
    let store = connect().await;
    let ttl = Duration::from_secs(30);

    assert!(store.set_if_absent("it:nx", b"a", ttl).await.unwrap());
    assert!(!store.set_if_absent("it:nx", b"b", ttl).await.unwrap());
    assert_eq!(store.get("it:nx").await.unwrap(), Some(b"a".to_vec()));

    assert!(!store.delete_if_equals("it:nx", b"b").await.unwrap());
    assert!(store.delete_if_equals("it:nx", b"a").await.unwrap());
    assert!(store.get("it:nx").await.unwrap().is_none());
}

#[tokio::test]
async fn test_redis_store_scan_prefix_escapes_patterns() {
    let store = connect().await;
    let ttl = Duration::from_secs(30);
    for key in ["scan*:1", "scan*:2", "scanx:1"] {
        store.set_with_ttl(key, b"v", ttl).await.unwrap();
    }

    let mut keys = store.scan_prefix("scan*:").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["scan*:1".to_string(), "scan*:2".to_string()]);

    assert_eq!(store.delete_many(&keys).await.unwrap(), 2);
    assert!(store.get("scanx:1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_redis_lock_is_owned() {
    let store = connect().await;
    let lock = DistributedLock::new(store.clone(), "it:lock", Duration::from_millis(200));

    let first = lock.try_acquire().await.unwrap().expect("first holder");
    assert!(lock.try_acquire().await.unwrap().is_none());

    // The first holder's lease runs out and someone else takes the lock.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = lock.try_acquire().await.unwrap().expect("second holder");

    // A stale release must not free the second holder's lock.
    assert!(!first.release().await.unwrap());
    assert!(lock.try_acquire().await.unwrap().is_none());
    assert!(second.release().await.unwrap());
    assert!(lock.try_acquire().await.unwrap().is_some());
}

#[tokio::test]
async fn test_redis_cross_instance_invalidation() {
    let store_a = connect().await;
    let store_b = connect().await;
    let a = CacheRegistry::new(store_a, EngineConfig::default()).expect("registry a");
    let b = CacheRegistry::new(store_b, EngineConfig::default()).expect("registry b");
    let settings = CacheSettings::default();

    let cache_a = a.get_cache("it_users", &settings).unwrap();
    let cache_b = b.get_cache("it_users", &settings).unwrap();
    assert!(a.wait_listening("it_users", Duration::from_secs(5)).await);
    assert!(b.wait_listening("it_users", Duration::from_secs(5)).await);

    cache_a.put("1", Some(&"v1".to_string())).await.unwrap();
    assert_eq!(cache_b.get::<String>("1").await.unwrap(), Some("v1".into()));

    cache_a.put("1", Some(&"v2".to_string())).await.unwrap();
    let mut evicted = false;
    for _ in 0..100 {
        if cache_b.local().unwrap().get::<String>("1").await.unwrap().is_none() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(evicted);
    assert_eq!(cache_b.get::<String>("1").await.unwrap(), Some("v2".into()));

    cache_a.clear().await.unwrap();
    assert!(cache_a.remote().get::<String>("1").await.unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_redis_concurrent_loads_run_once() {
    let store = connect().await;
    let registry = CacheRegistry::new(store, EngineConfig::default()).expect("registry");
    let cache = registry
        .get_cache("it_stampede", &CacheSettings::default())
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_with("1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::io::Error>(Some(7u32))
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Some(7));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.clear().await.unwrap();
    registry.shutdown().await;
}

#[tokio::test]
async fn test_redis_store_connect_direct() {
    let store = RedisStore::connect(&RedisConfig::with_url(get_redis_url().await))
        .await
        .expect("connect");
    store.ping().await.unwrap();
}
