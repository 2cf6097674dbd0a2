use async_trait::async_trait;
use std::time::Duration;

use crate::types::BatchOp;
use crate::types::NotificationStream;
use crate::types::StoreResult;

/// Key-value store the memoization protocol runs against.
///
/// All contended state (cache entries and locks) is only ever mutated through these primitives, so every one of
/// them must be atomic on the store side. Nothing here is protected by client-side locking.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Set `key` only if it doesn't exist yet. Returns `true` if the value has been set.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// If the value stored under `key` equals `expected` then reset its expiration to `ttl` and return `true`.
    /// Otherwise return `false` without side effects. Must be a single atomic operation.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool>;

    /// Apply all operations at once or report failure.
    async fn exec_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;
}

/// The subscribing side of the notification bus.
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Subscribe to all channels matching a glob `pattern`. The returned stream ends when the subscription is lost.
    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream>;
}
