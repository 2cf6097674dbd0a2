use fieldx::fxstruct;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;

use crate::config::MemoConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BoxError;
use crate::error::MemoError;
use crate::error::Result;
use crate::keys::KeySpace;
use crate::lock::LockManager;
use crate::lock::LockRenewer;
use crate::registry::WaiterRegistry;
use crate::traits::CacheStore;
use crate::traits::NotificationSource;
use crate::types::BatchOp;
use crate::types::Computed;

/// Get-or-compute with a single computation per resource across every process sharing the store.
///
/// ```ignore
/// let server = MemoryServer::new();
/// let cache = Arc::new(
///     MemoCache::builder()
///         .store(Arc::new(server.connect()))
///         .subscriber(Arc::new(server.connect()))
///         .resource_tag("gdsp")
///         .lock_timeout(Duration::from_secs(3))
///         .build()?,
/// );
///
/// let value = cache
///     .get_resource("AA-1", Duration::from_secs(10), || async {
///         let value = expensive().await?;
///         Ok::<_, MyError>(Computed::new(value, Duration::from_secs(4)))
///     })
///     .await?;
/// ```
///
/// The store and the subscriber must be different connections: the subscribing one is switched into pattern
/// subscription mode and can't be used for anything else afterwards. `build()` fails with
/// [`MemoError::Configuration`] otherwise.
///
/// A cache is meant to be shared between tasks, wrap it into an `Arc`.
#[fxstruct(sync, no_new, default(off), builder(error(MemoError), post_build))]
pub struct MemoCache<S, N>
where
    S: CacheStore,
    N: NotificationSource,
{
    /// Connection for reads, writes, locking, and publishing.
    #[fieldx(get(clone), builder(required))]
    store: Arc<S>,

    /// Connection dedicated to the notification pattern subscription.
    #[fieldx(get(clone), builder(required))]
    subscriber: Arc<N>,

    /// Namespace prefix of every key and channel this cache touches.
    #[fieldx(get, builder(into), default("memo".to_string()))]
    resource_tag: String,

    /// Lease of the computation lock.
    #[fieldx(get(copy), default(Duration::from_secs(10)))]
    lock_timeout: Duration,

    /// Default patience of [`fetch`](Self::fetch) and [`fetch_renewable`](Self::fetch_renewable).
    #[fieldx(get(copy), default(Duration::from_secs(30)))]
    wait_timeout: Duration,

    #[fieldx(lazy, get(clone), builder(off))]
    keys: Arc<KeySpace>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    locks: Arc<LockManager<S>>,

    #[fieldx(private, get(clone), builder(off), default(Arc::new(WaiterRegistry::new())))]
    registry: Arc<WaiterRegistry>,

    #[fieldx(private, get, builder(off), default(OnceCell::new()))]
    listening: OnceCell<()>,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    dispatcher: Dispatcher,
}

impl<S, N> MemoCache<S, N>
where
    S: CacheStore,
    N: NotificationSource,
{
    fn build_keys(&self) -> Arc<KeySpace> {
        Arc::new(KeySpace::new(self.resource_tag().as_str()))
    }

    fn build_locks(&self) -> Arc<LockManager<S>> {
        Arc::new(LockManager::new(self.store()))
    }

    fn post_build(self) -> Result<Self> {
        if std::ptr::addr_eq(Arc::as_ptr(&self.store), Arc::as_ptr(&self.subscriber)) {
            return Err(MemoError::Configuration(
                "subscriber and store connections must be different objects".to_string(),
            ));
        }
        if self.resource_tag.is_empty() {
            return Err(MemoError::Configuration("resource tag cannot be empty".to_string()));
        }
        if self.lock_timeout.is_zero() {
            return Err(MemoError::Configuration("lock timeout must be positive".to_string()));
        }
        Ok(self)
    }

    pub fn from_config(store: Arc<S>, subscriber: Arc<N>, config: &MemoConfig) -> Result<Arc<Self>> {
        let cache = Self::builder()
            .store(store)
            .subscriber(subscriber)
            .resource_tag(config.resource_tag.clone())
            .lock_timeout(config.lock_timeout())
            .wait_timeout(config.wait_timeout())
            .build()?;
        Ok(Arc::new(cache))
    }

    /// Subscribe to this namespace's notifications and start dispatching them.
    ///
    /// Happens implicitly the first time a caller has to wait; call it to pay the cost upfront. Repeated calls are
    /// no-ops.
    pub async fn listen(&self) -> Result<()> {
        self.listening()
            .get_or_try_init(|| async {
                let pattern = self.keys().notification_pattern();
                let stream = self.subscriber.psubscribe(&pattern).await?;
                self.set_dispatcher(Dispatcher::start(stream, self.registry()));
                debug!("listening on {pattern}");
                Ok::<(), MemoError>(())
            })
            .await?;
        Ok(())
    }

    /// Get the resource from the cache, computing it with `compute` on a miss.
    ///
    /// Only one caller per resource id, cluster-wide, runs its `compute`; everybody else waits up to `timeout` for
    /// the result. The lease taken for the computation is [`lock_timeout`](Self::lock_timeout) long. Computations
    /// that may outlive it should use [`get_resource_renewable`](Self::get_resource_renewable).
    #[instrument(level = "debug", skip(self, compute))]
    pub async fn get_resource<F, Fut, E>(&self, resource_id: &str, timeout: Duration, compute: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        let token = Self::request_token();
        self.get_resource_impl(resource_id, timeout, &token, compute, None)
            .await
    }

    /// Same as [`get_resource`](Self::get_resource) but `compute` receives a [`LockRenewer`] to extend its lease.
    ///
    /// A failed renewal means the lease has been lost and possibly taken over by a competitor. The computation must
    /// give up then; if it completes anyway, its result is discarded and the call fails with
    /// [`MemoError::LockRenewalLost`].
    #[instrument(level = "debug", skip(self, compute))]
    pub async fn get_resource_renewable<F, Fut, E>(
        &self,
        resource_id: &str,
        timeout: Duration,
        compute: F,
    ) -> Result<String>
    where
        F: FnOnce(LockRenewer<S>) -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        let token = Self::request_token();
        let renewer = self
            .locks()
            .renewer(self.keys().lock_key(resource_id), token.as_str());
        let ownership = renewer.clone();

        self.get_resource_impl(resource_id, timeout, &token, move || compute(renewer), Some(&ownership))
            .await
    }

    /// [`get_resource`](Self::get_resource) with the configured [`wait_timeout`](Self::wait_timeout).
    pub async fn fetch<F, Fut, E>(&self, resource_id: &str, compute: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        self.get_resource(resource_id, self.wait_timeout(), compute).await
    }

    /// [`get_resource_renewable`](Self::get_resource_renewable) with the configured
    /// [`wait_timeout`](Self::wait_timeout).
    pub async fn fetch_renewable<F, Fut, E>(&self, resource_id: &str, compute: F) -> Result<String>
    where
        F: FnOnce(LockRenewer<S>) -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        self.get_resource_renewable(resource_id, self.wait_timeout(), compute)
            .await
    }

    /// Number of callers of this instance currently waiting on `resource_id`.
    pub fn pending_waiters(&self, resource_id: &str) -> usize {
        self.registry()
            .pending(&self.keys().notification_channel(resource_id))
    }

    /// Stop dispatching notifications. Callers waiting at the moment, and any that would wait later, fail with
    /// [`MemoError::DispatcherGone`]. Cache hits and leaders are not affected.
    pub fn close(&self) {
        // Dropping the dispatcher aborts its task.
        drop(self.clear_dispatcher());
        self.registry().close();
    }

    fn request_token() -> String {
        Uuid::new_v4().to_string()
    }

    async fn get_resource_impl<F, Fut, E>(
        &self,
        resource_id: &str,
        timeout: Duration,
        token: &str,
        compute: F,
        ownership: Option<&LockRenewer<S>>,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        let keys = self.keys();
        let resource_key = keys.resource_key(resource_id);

        if let Some(value) = self.store.get(&resource_key).await? {
            debug!("cache hit: {resource_key}");
            return Ok(value);
        }

        let lock_key = keys.lock_key(resource_id);
        let channel = keys.notification_channel(resource_id);

        if self
            .locks()
            .acquire(&lock_key, token, self.lock_timeout())
            .await?
        {
            debug!("leading computation of {resource_key}");
            self.compute_and_publish(&resource_key, &lock_key, &channel, compute, ownership)
                .await
        }
        else {
            debug!("{lock_key} is taken, waiting on {channel}");
            self.wait_for(&resource_key, &channel, timeout).await
        }
    }

    async fn compute_and_publish<F, Fut, E>(
        &self,
        resource_key: &str,
        lock_key: &str,
        channel: &str,
        compute: F,
        ownership: Option<&LockRenewer<S>>,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
        E: Into<BoxError>,
    {
        let computed = match compute().await {
            Ok(computed) => computed,
            Err(err) => {
                let err = MemoError::from_compute(err);
                if err.is_lock_lost() || ownership.is_some_and(LockRenewer::is_lost) {
                    // Not ours anymore, whatever error type reported it. Deleting would free somebody else's lease.
                    debug!("{lock_key} lost during computation: {err}");
                    return Err(MemoError::LockRenewalLost {
                        lock_key: lock_key.to_string(),
                    });
                }
                if let Err(release_err) = self.locks().release(lock_key).await {
                    warn!("failed to release {lock_key} after computation error: {release_err}");
                }
                return Err(err);
            }
        };

        if ownership.is_some_and(|renewer| renewer.is_lost()) {
            return Err(MemoError::LockRenewalLost {
                lock_key: lock_key.to_string(),
            });
        }

        // The lock is left to expire on its own, both on success and on failure.
        self.store
            .exec_batch(vec![
                BatchOp::Set {
                    key:   resource_key.to_string(),
                    value: computed.value.clone(),
                    ttl:   computed.ttl,
                },
                BatchOp::Publish {
                    channel: channel.to_string(),
                    message: computed.value.clone(),
                },
            ])
            .await
            .map_err(MemoError::BatchWrite)?;

        Ok(computed.value)
    }

    async fn wait_for(&self, resource_key: &str, channel: &str, timeout: Duration) -> Result<String> {
        self.listen().await?;

        let registry = self.registry();
        // Subscribe first, re-read second. The other way around a value published in between would be missed.
        let (waiter_id, rx) = registry.subscribe(channel);

        match self.store.get(resource_key).await {
            Ok(Some(value)) => {
                registry.forget(channel, waiter_id);
                debug!("{resource_key} appeared before notification");
                return Ok(value);
            }
            Ok(None) => (),
            Err(err) => {
                registry.forget(channel, waiter_id);
                return Err(err.into());
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MemoError::DispatcherGone {
                channel: channel.to_string(),
            }),
            Err(_) => {
                registry.forget(channel, waiter_id);
                Err(MemoError::Timeout {
                    channel: channel.to_string(),
                    timeout,
                })
            }
        }
    }
}
