//! TTL-bounded distributed lock over the shared store.

use std::time::Duration;

use tiercache_store::{DynStore, StoreResult};
use tokio::time::Instant;
use uuid::Uuid;

/// Delay between attempts of a blocking [`DistributedLock::acquire`].
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Mutual exclusion across processes, backed by set-if-absent with a TTL.
///
/// Every acquisition writes a fresh owner token, and release only deletes the
/// key while it still holds that token. A holder whose lock expired can
/// therefore never release a later holder's lock.
#[derive(Clone)]
pub struct DistributedLock {
    store: DynStore,
    key: String,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl DistributedLock {
    pub fn new(store: DynStore, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Bound for [`acquire`](Self::acquire).
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire the lock if it is free, without waiting.
    pub async fn try_acquire(&self) -> StoreResult<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        if self
            .store
            .set_if_absent(&self.key, token.as_bytes(), self.ttl)
            .await?
        {
            tracing::trace!(lock = %self.key, "lock acquired");
            Ok(Some(LockHandle {
                store: self.store.clone(),
                key: self.key.clone(),
                token,
                ttl: self.ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Poll for the lock until it is acquired or the acquire timeout elapses.
    pub async fn acquire(&self) -> StoreResult<Option<LockHandle>> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if let Some(handle) = self.try_acquire().await? {
                return Ok(Some(handle));
            }
            if Instant::now() >= deadline {
                tracing::debug!(lock = %self.key, timeout = ?self.acquire_timeout, "lock not acquired");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// A held lock. Dropping it without [`release`](Self::release) leaves the lock
/// to expire after its TTL.
#[must_use = "a lock handle should be released"]
pub struct LockHandle {
    store: DynStore,
    key: String,
    token: String,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Release the lock if this handle still owns it.
    ///
    /// Returns `false` if the lock had already expired or changed hands.
    pub async fn release(self) -> StoreResult<bool> {
        let released = self
            .store
            .delete_if_equals(&self.key, self.token.as_bytes())
            .await?;
        if !released {
            tracing::debug!(lock = %self.key, "lock expired before release");
        }
        Ok(released)
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}
