//! Background execution of hard refreshes.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;

/// Upper bound on concurrent refresh slots.
pub const MAX_REFRESH_SLOTS: usize = 4096;

/// A refresh is identified by the cache it belongs to and the store key.
type RefreshKey = (String, String);

/// Bounded executor for refresh tasks, de-duplicated per cache and key.
///
/// A submission is dropped when a refresh for the same entry is already
/// running or every slot is busy; the entry stays readable and a later read
/// within the refresh window submits again.
#[derive(Debug, Clone)]
pub struct RefreshExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<DashSet<RefreshKey>>,
}

/// Removes a key from the in-flight set when the task ends, even on panic.
struct InFlightGuard {
    key: RefreshKey,
    in_flight: Arc<DashSet<RefreshKey>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

impl RefreshExecutor {
    /// Executor with `capacity` slots, clamped to `1..=MAX_REFRESH_SLOTS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_REFRESH_SLOTS);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Spawn `task` for `key` of `cache`. Returns `false` if it was not scheduled.
    pub fn submit<Fut>(&self, cache: &str, key: &str, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = (cache.to_string(), key.to_string());
        if !self.in_flight.insert(entry.clone()) {
            tracing::trace!(cache = %cache, key = %key, "refresh already in flight");
            return false;
        }
        let guard = InFlightGuard {
            key: entry,
            in_flight: self.in_flight.clone(),
        };
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(cache = %cache, key = %key, capacity = self.capacity, "refresh executor saturated, skipping refresh");
            return false;
        };

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await;
        });
        true
    }

    /// Number of refreshes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait until every running refresh has finished.
    pub async fn quiesce(&self) {
        // Holding every permit at once means nothing else is running.
        let Ok(slots) = u32::try_from(self.capacity) else {
            return;
        };
        if let Ok(all) = self.permits.acquire_many(slots).await {
            drop(all);
        }
    }
}
