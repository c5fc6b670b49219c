//! Store error types.
//!
//! Every backend maps its client errors into [`StoreError`] so the engine can
//! propagate store unavailability without knowing which backend is in use.

/// Errors that can occur while talking to the distributed store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not obtain a pooled connection.
    #[error("Store pool error: {message}")]
    Pool {
        /// Description of the pool failure.
        message: String,
    },

    /// Could not open a connection to the store.
    #[error("Store connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// A command was sent but the store rejected it or the reply was malformed.
    #[error("Store command error: {message}")]
    Command {
        /// Description of the command failure.
        message: String,
    },

    /// A pub/sub subscription could not be established.
    #[error("Store subscribe error: {message}")]
    Subscribe {
        /// Description of the subscription failure.
        message: String,
    },

    /// The pub/sub stream ended.
    #[error("Store pub/sub stream closed")]
    Closed,
}

impl StoreError {
    /// Creates a new `Pool` error.
    #[must_use]
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Command` error.
    #[must_use]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Creates a new `Subscribe` error.
    #[must_use]
    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe {
            message: message.into(),
        }
    }

    /// Returns true if the error means the store could not be reached at all.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Pool { .. } | Self::Connection { .. } | Self::Closed)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::connection(err.to_string())
        } else {
            Self::command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::pool(err.to_string())
    }
}
