//! # tiercache
//!
//! Two-tier cache: a bounded in-process tier in front of a shared distributed
//! tier, with stampede-protected loads, proactive refresh near expiry, cached
//! null results and cross-instance invalidation over pub/sub.
//!
//! ## Overview
//!
//! - [`LocalTier`]: moka-backed, bounded, time-expiring; never holds nulls
//! - [`RemoteTier`]: distributed tier; loads are serialized by a
//!   [`DistributedLock`] and waiters are woken by the [`WaitCoordinator`]
//! - [`LayeredCache`]: read-through over both tiers, invalidation broadcast
//! - [`CacheRegistry`]: one [`LayeredCache`] per `(name, settings)`, plus the
//!   listener applying other instances' invalidations
//! - [`CacheInterceptor`]: cacheable / put / evict around caller functions
//!
//! ## Example
//!
//! ```ignore
//! use tiercache::{CacheRegistry, load_config};
//!
//! let config = load_config(None)?;
//! let registry = CacheRegistry::connect(config).await?;
//! let users = registry.get_configured("users")?;
//!
//! let user: Option<User> = users
//!     .get_with("42", || async move { repo.find_user(42).await })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod interceptor;
pub mod layered;
mod listener;
mod loader;
pub mod local;
pub mod message;
pub mod metrics;
pub mod observability;
pub mod refresh;
pub mod registry;
pub mod remote;
pub mod stats;
pub mod sync;
pub mod value;

pub use config::{
    CacheSettings, EngineConfig, ExpireMode, FirstTierSettings, LoggingConfig, SecondTierSettings,
    TierCacheConfig, load_config,
};
pub use error::{BoxError, CacheError, CacheResult};
pub use interceptor::{CacheInterceptor, CacheOperation, CachedFn, EvictTarget};
pub use layered::LayeredCache;
pub use local::LocalTier;
pub use message::{InvalidationKind, InvalidationMessage};
pub use refresh::RefreshExecutor;
pub use registry::CacheRegistry;
pub use remote::RemoteTier;
pub use stats::CacheStats;
pub use sync::{DistributedLock, LockHandle, WaitCoordinator};
pub use value::{CacheValue, StoredValue, ValueAdapter};

pub use tiercache_store::{
    ChannelMessage, DistributedStore, DynStore, KeyTtl, MemoryStore, RedisConfig, RedisStore,
    StoreError, Subscriber,
};
