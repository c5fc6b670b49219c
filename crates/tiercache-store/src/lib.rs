//! # tiercache-store
//!
//! Distributed store abstraction for the tiercache engine.
//!
//! The engine only needs a handful of primitives from the shared tier: plain
//! get/set with TTL, atomic set-if-absent, compare-and-delete, TTL inspection,
//! prefix scans, and pub/sub. [`DistributedStore`] captures exactly those.
//!
//! ## Backends
//!
//! - [`RedisStore`]: deadpool-redis pool for commands, dedicated connection for pub/sub
//! - [`MemoryStore`]: process-local store for single-instance mode and tests
//!
//! ## Example
//!
//! ```ignore
//! use tiercache_store::{DistributedStore, RedisConfig, RedisStore};
//!
//! let store = RedisStore::connect(&RedisConfig::with_url("redis://localhost:6379")).await?;
//! store.set_with_ttl("users:1", b"...", Duration::from_secs(60)).await?;
//! ```

mod config;
mod error;
mod memory;
mod redis_store;
mod traits;

pub use config::RedisConfig;
pub use error::StoreError;
pub use memory::{MemoryStore, MemorySubscriber};
pub use redis_store::{RedisStore, RedisSubscriber};
pub use traits::{ChannelMessage, DistributedStore, KeyTtl, Subscriber};

/// Type alias for a store result.
pub type StoreResult<T> = Result<T, StoreError>;

/// Type alias for a shareable store trait object.
pub type DynStore = std::sync::Arc<dyn DistributedStore>;

/// Connect to the configured store.
///
/// With Redis disabled this returns a fresh [`MemoryStore`], which only
/// coordinates callers inside this process.
pub async fn connect(config: &RedisConfig) -> StoreResult<DynStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-memory store (single instance)");
        return Ok(std::sync::Arc::new(MemoryStore::new()));
    }
    config.validate().map_err(StoreError::connection)?;
    Ok(std::sync::Arc::new(RedisStore::connect(config).await?))
}
