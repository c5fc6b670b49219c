//! Invocation of caller-supplied loaders.

use std::future::Future;
use std::time::Duration;

use crate::error::{BoxError, CacheError, CacheResult};

/// Run `loader` for `key`, bounded by `timeout`.
///
/// Loader errors are wrapped with the key; an elapsed timeout becomes
/// [`CacheError::LoaderTimeout`].
pub(crate) async fn run_loader<T, F, Fut, E>(
    key: &str,
    timeout: Duration,
    loader: F,
) -> CacheResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Into<BoxError>,
{
    match tokio::time::timeout(timeout, loader()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CacheError::loader(key, e)),
        Err(_) => {
            tracing::warn!(key = %key, timeout = ?timeout, "loader timed out");
            Err(CacheError::LoaderTimeout {
                key: key.to_string(),
                timeout,
            })
        }
    }
}
