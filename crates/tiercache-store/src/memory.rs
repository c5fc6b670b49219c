//! In-memory store backend.
//!
//! Used for single-instance deployments (Redis disabled) and in tests, where
//! several registries sharing one [`MemoryStore`] behave like several processes
//! sharing one Redis. Expiry is evaluated lazily against `tokio::time::Instant`,
//! so tests running with a paused clock see deterministic TTLs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::traits::{ChannelMessage, DistributedStore, KeyTtl, Subscriber};
use crate::StoreResult;

/// Pub/sub buffer per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: deadline(Instant::now(), ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Expiry instant for `ttl` from `now`; a TTL past the clock's range never expires.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

struct Inner {
    data: DashMap<String, MemoryEntry>,
    events: broadcast::Sender<ChannelMessage>,
}

/// Shared in-memory implementation of [`DistributedStore`].
///
/// Cloning is cheap and every clone sees the same data and channels.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                data: DashMap::new(),
                events,
            }),
        }
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .data
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Returns true if the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.data.len();
        self.inner.data.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.inner.data.len())
    }

    /// Returns the live entry for `key`, removing it if it has expired.
    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let now = Instant::now();
        let entry = self.inner.data.get(key)?.clone();
        if entry.is_expired(now) {
            self.inner.data.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.inner.data.len())
            .finish()
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.inner
            .data
            .insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(MemoryEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .data
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .data
            .remove_if(key, |_, entry| {
                !entry.is_expired(now) && entry.value.as_slice() == expected
            })
            .is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let Some(entry) = self.live(key) else {
            return Ok(KeyTtl::Missing);
        };
        Ok(match entry.expires_at {
            Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
            None => KeyTtl::Persistent,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let Some(mut entry) = self.inner.data.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.inner.data.remove_if(key, |_, e| e.is_expired(now));
            return Ok(false);
        }
        entry.expires_at = deadline(now, ttl);
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .inner
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<()> {
        // No receivers is not an error, same as PUBLISH to an empty channel.
        let _ = self.inner.events.send(ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        tracing::trace!(channel = %channel, "published message (memory)");
        Ok(())
    }

    async fn subscriber(&self) -> StoreResult<Box<dyn Subscriber>> {
        Ok(Box::new(MemorySubscriber {
            events: self.inner.events.subscribe(),
            channels: HashSet::new(),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Subscriber over the in-process broadcast channel.
pub struct MemorySubscriber {
    events: broadcast::Receiver<ChannelMessage>,
    channels: HashSet<String>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> StoreResult<()> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> StoreResult<Option<ChannelMessage>> {
        loop {
            match self.events.recv().await {
                Ok(message) if self.channels.contains(&message.channel) => {
                    return Ok(Some(message));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }
}
