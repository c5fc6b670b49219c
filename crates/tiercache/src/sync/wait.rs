//! Process-local wait slots for in-flight loads.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Per-key registry of tasks waiting for another task's load to finish.
///
/// A slot exists only while someone waits on it: it is removed when signalled
/// or when its last waiter leaves.
#[derive(Debug, Default)]
pub struct WaitCoordinator {
    slots: DashMap<String, Arc<Notify>>,
}

impl WaitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is signalled or `timeout` elapses.
    ///
    /// Returns `true` if woken by [`signal_all`](Self::signal_all).
    pub async fn wait(&self, key: &str, timeout: Duration) -> bool {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        let signalled = tokio::time::timeout(timeout, slot.notified())
            .await
            .is_ok();

        drop(slot);
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        signalled
    }

    /// Wake every task currently waiting on `key`.
    pub fn signal_all(&self, key: &str) {
        if let Some((_, slot)) = self.slots.remove(key) {
            slot.notify_waiters();
        }
    }

    /// Number of keys with at least one waiter.
    pub fn waiting_keys(&self) -> usize {
        self.slots.len()
    }
}
