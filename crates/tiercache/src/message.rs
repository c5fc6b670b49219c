//! Cross-instance invalidation messages.
//!
//! A message is JSON published on a channel named after the cache:
//!
//! ```text
//! {"cacheName":"users","key":"42","kind":"Evict"}
//! {"cacheName":"users","key":null,"kind":"Clear"}
//! ```

use serde::{Deserialize, Serialize};
use tiercache_store::DistributedStore;

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationKind {
    /// Drop one key from the in-process tier.
    Evict,
    /// Drop every entry of the in-process tier.
    Clear,
}

impl InvalidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationKind::Evict => "evict",
            InvalidationKind::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub cache_name: String,
    pub key: Option<String>,
    pub kind: InvalidationKind,
}

impl InvalidationMessage {
    pub fn evict(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: Some(key.into()),
            kind: InvalidationKind::Evict,
        }
    }

    pub fn clear(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: None,
            kind: InvalidationKind::Clear,
        }
    }

    /// Channel the message is published on.
    pub fn channel(&self) -> &str {
        &self.cache_name
    }

    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            CacheError::serialization(self.key.as_deref().unwrap_or_default(), e)
        })
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Publish `message` on its cache channel.
pub async fn publish_invalidation(
    store: &dyn DistributedStore,
    message: &InvalidationMessage,
) -> CacheResult<()> {
    store.publish(message.channel(), &message.to_bytes()?).await?;
    tracing::debug!(
        cache = %message.cache_name,
        key = ?message.key,
        kind = message.kind.as_str(),
        "published cache invalidation"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tiercache_store::MemoryStore;

    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&InvalidationMessage::evict("users", "42")).unwrap();
        assert_eq!(json, r#"{"cacheName":"users","key":"42","kind":"Evict"}"#);

        let clear = InvalidationMessage::from_bytes(br#"{"cacheName":"users","key":null,"kind":"Clear"}"#)
            .unwrap();
        assert_eq!(clear, InvalidationMessage::clear("users"));
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        assert!(InvalidationMessage::from_bytes(b"users:42").is_err());
        assert!(InvalidationMessage::from_bytes(br#"{"cacheName":"users","kind":"Drop"}"#).is_err());
    }

    #[tokio::test]
    async fn test_publish_on_cache_channel() {
        let store = MemoryStore::new();
        let mut subscriber = store.subscriber().await.unwrap();
        subscriber.subscribe("users").await.unwrap();

        let message = InvalidationMessage::evict("users", "1");
        publish_invalidation(&store, &message).await.unwrap();

        let received = subscriber.next_message().await.unwrap().unwrap();
        assert_eq!(received.channel, "users");
        assert_eq!(InvalidationMessage::from_bytes(&received.payload).unwrap(), message);
    }
}
