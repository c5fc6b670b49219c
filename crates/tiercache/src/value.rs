//! Value adaptation between callers and the tiers.
//!
//! Every read and write goes through [`ValueAdapter`], so a cached null is
//! always an explicit [`StoredValue::Null`] in the distributed tier and never
//! confused with a missing key.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};

const NULL_TAG: u8 = 0x00;
const VALUE_TAG: u8 = 0x01;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue<T> {
    /// A cached value.
    Present(T),
    /// A cached null result.
    PresentNull,
    /// No entry.
    Absent,
}

impl<T> CacheValue<T> {
    /// Returns true if an entry exists, including a cached null.
    pub fn is_present(&self) -> bool {
        !matches!(self, CacheValue::Absent)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, CacheValue::Absent)
    }

    /// Collapses the tri-state into the caller's view: a cached null and a
    /// missing entry both become `None`.
    pub fn into_option(self) -> Option<T> {
        match self {
            CacheValue::Present(value) => Some(value),
            CacheValue::PresentNull | CacheValue::Absent => None,
        }
    }

    pub fn as_ref(&self) -> CacheValue<&T> {
        match self {
            CacheValue::Present(value) => CacheValue::Present(value),
            CacheValue::PresentNull => CacheValue::PresentNull,
            CacheValue::Absent => CacheValue::Absent,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheValue<U> {
        match self {
            CacheValue::Present(value) => CacheValue::Present(f(value)),
            CacheValue::PresentNull => CacheValue::PresentNull,
            CacheValue::Absent => CacheValue::Absent,
        }
    }
}

/// A value in its stored form.
///
/// On the wire a stored value is one tag byte followed by the MessagePack
/// payload; the null sentinel is the lone tag `0x00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Null,
    Value(Arc<Vec<u8>>),
}

impl StoredValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StoredValue::Null)
    }

    /// Encoded payload, if this is not the null sentinel.
    pub fn payload(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            StoredValue::Value(payload) => Some(payload),
            StoredValue::Null => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            StoredValue::Null => vec![NULL_TAG],
            StoredValue::Value(payload) => {
                let mut bytes = Vec::with_capacity(payload.len() + 1);
                bytes.push(VALUE_TAG);
                bytes.extend_from_slice(payload);
                bytes
            }
        }
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> CacheResult<Self> {
        match bytes.split_first() {
            Some((&NULL_TAG, [])) => Ok(StoredValue::Null),
            Some((&VALUE_TAG, payload)) => Ok(StoredValue::Value(Arc::new(payload.to_vec()))),
            Some((tag, _)) => Err(CacheError::serialization(
                key,
                format!("unknown value tag 0x{tag:02x}"),
            )),
            None => Err(CacheError::serialization(key, "empty stored value")),
        }
    }
}

/// Encode a value to its MessagePack payload.
pub fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> CacheResult<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| CacheError::serialization(key, e))
}

/// Decode a MessagePack payload.
pub fn decode<T: DeserializeOwned>(key: &str, payload: &[u8]) -> CacheResult<T> {
    rmp_serde::from_slice(payload).map_err(|e| CacheError::serialization(key, e))
}

/// Null-handling policy of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueAdapter {
    allow_null: bool,
}

impl ValueAdapter {
    pub fn new(allow_null: bool) -> Self {
        Self { allow_null }
    }

    pub fn allow_null(&self) -> bool {
        self.allow_null
    }

    /// Stored form of a caller value.
    ///
    /// Returns `None` ("do not store") for a null when nulls are not allowed.
    pub fn to_stored<T: Serialize>(
        &self,
        key: &str,
        value: Option<&T>,
    ) -> CacheResult<Option<StoredValue>> {
        match value {
            Some(value) => Ok(Some(StoredValue::Value(Arc::new(encode(key, value)?)))),
            None if self.allow_null => Ok(Some(StoredValue::Null)),
            None => Ok(None),
        }
    }

    /// Caller view of a stored value.
    pub fn from_stored<T: DeserializeOwned>(
        &self,
        key: &str,
        stored: &StoredValue,
    ) -> CacheResult<CacheValue<T>> {
        match stored {
            StoredValue::Null => Ok(CacheValue::PresentNull),
            StoredValue::Value(payload) => Ok(CacheValue::Present(decode(key, payload)?)),
        }
    }
}
