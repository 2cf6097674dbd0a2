use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::instrument;

use crate::error::MemoError;
use crate::error::Result;
use crate::traits::CacheStore;

/// Lease-based distributed lock on top of a [`CacheStore`].
///
/// Mutual exclusion comes solely from the store's conditional set, hence it spans every process sharing the store.
pub struct LockManager<S>
where
    S: CacheStore,
{
    store: Arc<S>,
}

impl<S> LockManager<S>
where
    S: CacheStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Try to take the lease. Returns `false` if somebody else holds it.
    #[instrument(level = "trace", skip(self))]
    pub async fn acquire(&self, lock_key: &str, token: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store.set_if_absent_with_ttl(lock_key, token, ttl).await?)
    }

    /// Extend the lease to `extension` from now, but only while `token` still owns it.
    #[instrument(level = "trace", skip(self))]
    pub async fn renew(&self, lock_key: &str, token: &str, extension: Duration) -> Result<bool> {
        Ok(self.store.expire_if_equals(lock_key, token, extension).await?)
    }

    /// Delete the lock.
    ///
    /// <div class="warning">
    /// Ownership is not verified. If the lease has already expired and was taken over, this deletes the new owner's
    /// lock. Only call it right after a failure of a computation that was started under a fresh lease.
    /// </div>
    #[instrument(level = "trace", skip(self))]
    pub async fn release(&self, lock_key: &str) -> Result<()> {
        Ok(self.store.delete(lock_key).await?)
    }

    /// A renewal handle bound to one lock key and ownership token.
    pub fn renewer(&self, lock_key: impl Into<String>, token: impl Into<String>) -> LockRenewer<S> {
        LockRenewer {
            locks:    self.clone(),
            lock_key: lock_key.into(),
            token:    token.into(),
            lost:     Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<S> Clone for LockManager<S>
where
    S: CacheStore,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> Debug for LockManager<S>
where
    S: CacheStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

/// Lets a long-running computation keep its lease alive.
///
/// Once a renewal fails the handle remembers it: the computation is no longer the single-flight leader and its
/// result won't be published even if it completes successfully.
pub struct LockRenewer<S>
where
    S: CacheStore,
{
    locks:    LockManager<S>,
    lock_key: String,
    token:    String,
    lost:     Arc<AtomicBool>,
}

impl<S> LockRenewer<S>
where
    S: CacheStore,
{
    /// Reset the lease to expire `extension` from now.
    ///
    /// Fails with [`MemoError::LockRenewalLost`] if the lease is no longer held by this call. Treat that as fatal.
    pub async fn renew(&self, extension: Duration) -> Result<()> {
        if self.locks.renew(&self.lock_key, &self.token, extension).await? {
            debug!("lease {} extended by {extension:?}", self.lock_key);
            Ok(())
        }
        else {
            self.lost.store(true, Ordering::Release);
            Err(MemoError::LockRenewalLost {
                lock_key: self.lock_key.clone(),
            })
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `true` once any renewal through this handle (or its clones) has failed.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl<S> Clone for LockRenewer<S>
where
    S: CacheStore,
{
    fn clone(&self) -> Self {
        Self {
            locks:    self.locks.clone(),
            lock_key: self.lock_key.clone(),
            token:    self.token.clone(),
            lost:     Arc::clone(&self.lost),
        }
    }
}

impl<S> Debug for LockRenewer<S>
where
    S: CacheStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRenewer")
            .field("lock_key", &self.lock_key)
            .field("token", &self.token)
            .field("lost", &self.is_lost())
            .finish()
    }
}
