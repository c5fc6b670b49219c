//! Error types for the caching engine.

use std::time::Duration;

use tiercache_store::StoreError;

/// Boxed error returned by a caller-supplied loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The loader callback failed for `key`.
    #[error("Loader failed for key '{key}': {source}")]
    Loader {
        /// Key whose value was being computed.
        key: String,
        /// Error raised by the loader.
        #[source]
        source: BoxError,
    },

    /// The loader callback did not complete within the configured bound.
    #[error("Loader for key '{key}' timed out after {timeout:?}")]
    LoaderTimeout {
        /// Key whose value was being computed.
        key: String,
        /// Configured loader timeout.
        timeout: Duration,
    },

    /// A value could not be encoded for, or decoded from, the store.
    #[error("Serialization failed for key '{key}': {message}")]
    Serialization {
        /// Key of the offending value.
        key: String,
        /// Codec error description.
        message: String,
    },

    /// The distributed store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache settings failed validation.
    #[error("Invalid cache settings: {0}")]
    InvalidSettings(String),

    /// A cache name was registered with a second, different settings fingerprint.
    #[error(
        "Cache '{name}' is already registered with settings {existing}; refusing {requested}"
    )]
    ConflictingSettings {
        /// Cache name.
        name: String,
        /// Fingerprint already registered under the name.
        existing: String,
        /// Fingerprint of the rejected settings.
        requested: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Creates a new `Loader` error.
    #[must_use]
    pub fn loader(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Loader {
            key: key.into(),
            source: source.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if a stored value could not be encoded or decoded.
    ///
    /// Callers typically evict the key and retry in this case.
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }

    /// Returns true if the loader failed or timed out.
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Self::Loader { .. } | Self::LoaderTimeout { .. })
    }

    /// The key the error relates to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Loader { key, .. }
            | Self::LoaderTimeout { key, .. }
            | Self::Serialization { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_keeps_key_and_cause() {
        let err = CacheError::loader("user:1", "db down");
        assert!(err.is_loader_failure());
        assert!(!err.is_serialization());
        assert_eq!(err.key(), Some("user:1"));
        assert_eq!(err.to_string(), "Loader failed for key 'user:1': db down");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_serialization_is_distinct() {
        let err = CacheError::serialization("k", "unexpected end of input");
        assert!(err.is_serialization());
        assert!(!err.is_loader_failure());
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: CacheError = StoreError::connection("refused").into();
        assert_eq!(err.to_string(), StoreError::connection("refused").to_string());
        assert_eq!(err.key(), None);
    }
}
