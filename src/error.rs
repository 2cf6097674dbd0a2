use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T, E = MemoError> = std::result::Result<T, E>;

/// Failures reported by a [`CacheStore`](crate::traits::CacheStore) or a
/// [`NotificationSource`](crate::traits::NotificationSource) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The connection has entered pattern-subscription mode and refuses regular commands.
    #[error("connection is in subscriber mode and cannot execute regular commands")]
    SubscriberMode,

    #[error("connection is closed")]
    Closed,

    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Error, Debug)]
pub enum MemoError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller-supplied computation failed. The original error is kept as is and can be downcast.
    #[error("resource computation failed: {0}")]
    Compute(#[source] BoxError),

    /// The lease on `lock_key` is no longer ours. The computation must not publish its result.
    #[error("unable to renew the lock '{lock_key}': ownership lost")]
    LockRenewalLost { lock_key: String },

    #[error("failed to store and publish the computed value: {0}")]
    BatchWrite(#[source] StoreError),

    #[error("timeout listening for subscription for {channel} after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("notification dispatcher is gone while waiting on {channel}")]
    DispatcherGone { channel: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),
}

impl MemoError {
    /// Wrap a computation failure. Errors that already are [`MemoError`] pass through untouched so that a
    /// [`LockRenewalLost`](MemoError::LockRenewalLost) propagated with `?` keeps its meaning.
    pub fn from_compute<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        match err.into().downcast::<MemoError>() {
            Ok(memo_err) => *memo_err,
            Err(other) => MemoError::Compute(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MemoError::Timeout { .. })
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, MemoError::LockRenewalLost { .. })
    }
}
