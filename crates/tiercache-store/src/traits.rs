//! Store traits consumed by the caching engine.

use std::time::Duration;

use async_trait::async_trait;

use crate::StoreResult;

/// Remaining lifetime of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists but has no expiration.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining lifetime, if the key exists and expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(remaining) => Some(*remaining),
            _ => None,
        }
    }

    /// Builds a [`KeyTtl`] from a Redis-style `PTTL` reply.
    ///
    /// `-2` means the key is missing and `-1` means it never expires.
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            m if m < 0 => KeyTtl::Persistent,
            m => KeyTtl::Expires(Duration::from_millis(m as u64)),
        }
    }
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Primitive operations the engine needs from the shared store.
///
/// Keys are plain strings; values are opaque bytes. Implementations must be
/// safe to share between tasks and between engine components.
#[async_trait]
pub trait DistributedStore: Send + Sync + 'static {
    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Atomically write a value only if the key is absent.
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically delete a key only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Delete several keys. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> StoreResult<u64>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Reset the lifetime of an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// List every key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<()>;

    /// Open a dedicated subscriber connection.
    async fn subscriber(&self) -> StoreResult<Box<dyn Subscriber>>;

    /// Cheap liveness probe used by health checks.
    async fn ping(&self) -> StoreResult<()>;
}

/// A pub/sub connection that can grow its channel set while it is being read.
///
/// `next_message` must be cancel-safe: dropping its future before completion
/// must not lose a message.
#[async_trait]
pub trait Subscriber: Send {
    /// Start receiving messages published on `channel`.
    async fn subscribe(&mut self, channel: &str) -> StoreResult<()>;

    /// Wait for the next message. `Ok(None)` means the stream ended.
    async fn next_message(&mut self) -> StoreResult<Option<ChannelMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_from_pttl() {
        assert_eq!(KeyTtl::from_pttl(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_pttl(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_pttl(1500),
            KeyTtl::Expires(Duration::from_millis(1500))
        );
        assert_eq!(KeyTtl::from_pttl(0).remaining(), Some(Duration::ZERO));
        assert_eq!(KeyTtl::Missing.remaining(), None);
    }
}
