use async_trait::async_trait;
use memo_cache::prelude::*;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio::time::Instant;

type Cache = MemoCache<MemoryConnection, MemoryConnection>;

const TAG: &str = "gdsp";
const LONG_TTL: Duration = Duration::from_secs(60);

/// One cache instance per simulated process, all sharing the same server.
fn instance(server: &MemoryServer, lock_timeout: Duration) -> Arc<Cache> {
    Arc::new(
        MemoCache::builder()
            .store(Arc::new(server.connect()))
            .subscriber(Arc::new(server.connect()))
            .resource_tag(TAG)
            .lock_timeout(lock_timeout)
            .build()
            .expect("cache instance"),
    )
}

/// Loses the lock race to a leader that stores and publishes its value right at that moment, before the loser had a
/// chance to subscribe.
struct LateToTheLock {
    inner: MemoryConnection,
    value: &'static str,
}

#[async_trait]
impl CacheStore for LateToTheLock {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        self.inner
            .exec_batch(vec![
                BatchOp::Set {
                    key:   format!("{TAG}:AA-1"),
                    value: self.value.to_string(),
                    ttl:   LONG_TTL,
                },
                BatchOp::Publish {
                    channel: format!("{TAG}/notif:AA-1"),
                    message: self.value.to_string(),
                },
            ])
            .await?;
        Ok(false)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire_if_equals(key, expected, ttl).await
    }

    async fn exec_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        self.inner.exec_batch(ops).await
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_compute_once() {
    let server = MemoryServer::new();
    let instances: Vec<_> = (0..3).map(|_| instance(&server, Duration::from_secs(10))).collect();
    let computations = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for i in 0..12 {
        let cache = Arc::clone(&instances[i % instances.len()]);
        let computations = Arc::clone(&computations);
        tasks.spawn(async move {
            cache
                .get_resource("AA-1", Duration::from_secs(10), || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(200)).await;
                    Ok::<_, String>(Computed::new("X", LONG_TTL))
                })
                .await
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), "X");
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    for cache in &instances {
        assert_eq!(cache.pending_waiters("AA-1"), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn two_callers_share_one_computation() {
    let server = MemoryServer::new();
    let cache = instance(&server, Duration::from_secs(10));
    let computations = Arc::new(AtomicUsize::new(0));

    let call = || {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        async move {
            cache
                .get_resource("AA-1", Duration::from_secs(10), || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Computed::new("X", Duration::from_secs(4)))
                })
                .await
        }
    };

    let (first, second) = tokio::join!(call(), call());
    assert_eq!(first.unwrap(), "X");
    assert_eq!(second.unwrap(), "X");
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_hit_skips_computation() {
    let server = MemoryServer::new();
    let cache = instance(&server, Duration::from_secs(10));
    server
        .connect()
        .set_with_ttl("gdsp:AA-1", "cached", LONG_TTL)
        .await
        .unwrap();

    let value = cache
        .get_resource("AA-1", Duration::from_secs(1), || async {
            Err::<Computed, _>("must not be called")
        })
        .await
        .unwrap();
    assert_eq!(value, "cached");
    // No waiting happened, so nothing subscribed either.
    assert_eq!(server.subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn value_lives_for_requested_ttl() {
    let server = MemoryServer::new();
    let cache = instance(&server, Duration::from_secs(3));
    let computations = Arc::new(AtomicUsize::new(0));

    let compute = |computations: Arc<AtomicUsize>| {
        move || async move {
            let n = computations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, String>(Computed::new(format!("v{n}"), Duration::from_secs(4)))
        }
    };

    let timeout = Duration::from_secs(10);
    assert_eq!(cache.get_resource("AA-1", timeout, compute(Arc::clone(&computations))).await.unwrap(), "v1");
    assert!(server.ttl("gdsp:AA-1").is_some_and(|ttl| ttl <= Duration::from_secs(4)));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.get_resource("AA-1", timeout, compute(Arc::clone(&computations))).await.unwrap(), "v1");

    sleep(Duration::from_secs(3)).await;
    assert_eq!(cache.get_resource("AA-1", timeout, compute(Arc::clone(&computations))).await.unwrap(), "v2");
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn waiter_timeouts_are_independent() {
    let server = MemoryServer::new();
    let leader = instance(&server, Duration::from_secs(10));
    let follower = instance(&server, Duration::from_secs(10));

    let leading = tokio::spawn({
        let leader = Arc::clone(&leader);
        async move {
            leader
                .get_resource("AA-1", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(Computed::new("slow", LONG_TTL))
                })
                .await
        }
    });
    sleep(Duration::from_millis(10)).await;

    let impatient = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move {
            follower
                .get_resource("AA-1", Duration::from_secs(1), || async {
                    Err::<Computed, _>("must not be called")
                })
                .await
        }
    });
    let patient = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move {
            follower
                .get_resource("AA-1", Duration::from_secs(10), || async {
                    Err::<Computed, _>("must not be called")
                })
                .await
        }
    });

    sleep(Duration::from_millis(10)).await;
    assert_eq!(follower.pending_waiters("AA-1"), 2);

    let err = impatient.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(err.to_string().contains("gdsp/notif:AA-1"));
    assert_eq!(follower.pending_waiters("AA-1"), 1);

    assert_eq!(patient.await.unwrap().unwrap(), "slow");
    assert_eq!(leading.await.unwrap().unwrap(), "slow");
    assert_eq!(follower.pending_waiters("AA-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_computation_releases_lock() {
    let server = MemoryServer::new();
    let leader = instance(&server, Duration::from_secs(10));
    let follower = instance(&server, Duration::from_secs(10));

    let leading = tokio::spawn({
        let leader = Arc::clone(&leader);
        async move {
            leader
                .get_resource("AA-1", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(1)).await;
                    Err::<Computed, _>("boom")
                })
                .await
        }
    });
    sleep(Duration::from_millis(10)).await;

    // Nothing is published for a failed computation, so the waiter can only time out.
    let waiting = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move {
            follower
                .get_resource("AA-1", Duration::from_secs(3), || async {
                    Err::<Computed, _>("must not be called")
                })
                .await
        }
    });

    match leading.await.unwrap() {
        Err(MemoError::Compute(err)) => assert_eq!(err.to_string(), "boom"),
        other => panic!("expected a computation error, got {other:?}"),
    }
    assert!(server.ttl("gdsp/lock:AA-1").is_none());
    assert!(waiting.await.unwrap().unwrap_err().is_timeout());

    // The next caller becomes a leader right away.
    let value = follower
        .get_resource("AA-1", Duration::from_secs(1), || async {
            Ok::<_, String>(Computed::new("retry", LONG_TTL))
        })
        .await
        .unwrap();
    assert_eq!(value, "retry");
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_leadership() {
    let server = MemoryServer::new();
    let leader = instance(&server, Duration::from_secs(1));
    let follower = instance(&server, Duration::from_secs(1));
    let computations = Arc::new(AtomicUsize::new(0));

    let leading = tokio::spawn({
        let leader = Arc::clone(&leader);
        let computations = Arc::clone(&computations);
        async move {
            leader
                .get_resource_renewable("AA-1", Duration::from_secs(10), |renewer| async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    for _ in 0..6 {
                        sleep(Duration::from_millis(500)).await;
                        renewer.renew(Duration::from_secs(1)).await?;
                    }
                    Ok::<_, MemoError>(Computed::new("long", LONG_TTL))
                })
                .await
        }
    });

    // Well past the original lease.
    sleep(Duration::from_millis(1500)).await;
    let computations_ = Arc::clone(&computations);
    let value = follower
        .get_resource("AA-1", Duration::from_secs(10), || async move {
            computations_.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Computed::new("competitor", LONG_TTL))
        })
        .await
        .unwrap();

    assert_eq!(value, "long");
    assert_eq!(leading.await.unwrap().unwrap(), "long");
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_lease_does_not_release_competitor_lock() {
    let server = MemoryServer::new();
    let first = instance(&server, Duration::from_secs(1));
    let second = instance(&server, Duration::from_secs(1));

    let stale = tokio::spawn({
        let first = Arc::clone(&first);
        async move {
            first
                .get_resource_renewable("AA-2", Duration::from_secs(10), |renewer| async move {
                    sleep(Duration::from_secs(2)).await;
                    renewer.renew(Duration::from_secs(1)).await?;
                    Ok::<_, MemoError>(Computed::new("stale", LONG_TTL))
                })
                .await
        }
    });

    // The first lease has expired by now, so this caller leads a second computation.
    sleep(Duration::from_millis(1500)).await;
    let fresh = tokio::spawn({
        let second = Arc::clone(&second);
        async move {
            second
                .get_resource("AA-2", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(1)).await;
                    Ok::<_, String>(Computed::new("fresh", LONG_TTL))
                })
                .await
        }
    });

    let err = stale.await.unwrap().unwrap_err();
    assert!(err.is_lock_lost(), "unexpected error: {err}");
    assert!(server.ttl("gdsp/lock:AA-2").is_some(), "competitor's lock must survive");

    assert_eq!(fresh.await.unwrap().unwrap(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn lost_lease_reported_with_foreign_error_keeps_competitor_lock() {
    let server = MemoryServer::new();
    let first = instance(&server, Duration::from_secs(1));
    let second = instance(&server, Duration::from_secs(1));

    let stale = tokio::spawn({
        let first = Arc::clone(&first);
        async move {
            first
                .get_resource_renewable("AA-2", Duration::from_secs(10), |renewer| async move {
                    sleep(Duration::from_secs(2)).await;
                    renewer
                        .renew(Duration::from_secs(1))
                        .await
                        .map_err(|err| err.to_string())?;
                    Ok::<_, String>(Computed::new("stale", LONG_TTL))
                })
                .await
        }
    });

    sleep(Duration::from_millis(1500)).await;
    let fresh = tokio::spawn({
        let second = Arc::clone(&second);
        async move {
            second
                .get_resource("AA-2", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(1)).await;
                    Ok::<_, String>(Computed::new("fresh", LONG_TTL))
                })
                .await
        }
    });

    let err = stale.await.unwrap().unwrap_err();
    assert!(err.is_lock_lost(), "unexpected error: {err}");
    assert!(server.ttl("gdsp/lock:AA-2").is_some(), "competitor's lock must survive");

    assert_eq!(fresh.await.unwrap().unwrap(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn result_after_lost_lease_is_refused() {
    let server = MemoryServer::new();
    let first = instance(&server, Duration::from_secs(1));
    let second = instance(&server, Duration::from_secs(1));

    let stale = tokio::spawn({
        let first = Arc::clone(&first);
        async move {
            first
                .get_resource_renewable("AA-2", Duration::from_secs(10), |renewer| async move {
                    sleep(Duration::from_secs(2)).await;
                    // Ignoring the loss doesn't help.
                    let _ = renewer.renew(Duration::from_secs(1)).await;
                    Ok::<_, MemoError>(Computed::new("stale", LONG_TTL))
                })
                .await
        }
    });

    sleep(Duration::from_millis(1500)).await;
    let fresh = tokio::spawn({
        let second = Arc::clone(&second);
        async move {
            second
                .get_resource("AA-2", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(1)).await;
                    Ok::<_, String>(Computed::new("fresh", LONG_TTL))
                })
                .await
        }
    });

    assert!(stale.await.unwrap().unwrap_err().is_lock_lost());
    assert_eq!(fresh.await.unwrap().unwrap(), "fresh");
    assert_eq!(server.connect().get("gdsp:AA-2").await.unwrap().as_deref(), Some("fresh"));
}

#[tokio::test(start_paused = true)]
async fn expired_lease_without_renewal_allows_double_computation() {
    let server = MemoryServer::new();
    let first = instance(&server, Duration::from_secs(1));
    let second = instance(&server, Duration::from_secs(1));
    let computations = Arc::new(AtomicUsize::new(0));

    let slow = |value: &'static str, delay: Duration, computations: Arc<AtomicUsize>| {
        move || async move {
            computations.fetch_add(1, Ordering::SeqCst);
            sleep(delay).await;
            Ok::<_, String>(Computed::new(value, LONG_TTL))
        }
    };

    let first_run = tokio::spawn({
        let first = Arc::clone(&first);
        let compute = slow("first", Duration::from_secs(2), Arc::clone(&computations));
        async move { first.get_resource("AA-2", Duration::from_secs(10), compute).await }
    });
    sleep(Duration::from_millis(1500)).await;
    let second_run = tokio::spawn({
        let second = Arc::clone(&second);
        let compute = slow("second", Duration::from_secs(1), Arc::clone(&computations));
        async move { second.get_resource("AA-2", Duration::from_secs(10), compute).await }
    });

    assert_eq!(first_run.await.unwrap().unwrap(), "first");
    assert_eq!(second_run.await.unwrap().unwrap(), "second");
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn value_published_before_subscribing_is_found_by_reread() {
    let server = MemoryServer::new();
    let cache = MemoCache::builder()
        .store(Arc::new(LateToTheLock {
            inner: server.connect(),
            value: "X",
        }))
        .subscriber(Arc::new(server.connect()))
        .resource_tag(TAG)
        .build()
        .unwrap();

    let started = Instant::now();
    let value = cache
        .get_resource("AA-1", Duration::from_secs(10), || async {
            Err::<Computed, _>("must not be called")
        })
        .await
        .unwrap();

    assert_eq!(value, "X");
    // The notification went out before the subscription, waiting for it would have timed out.
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(cache.pending_waiters("AA-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_batch_leaves_lock_to_expire() {
    let server = MemoryServer::new();
    let cache = instance(&server, Duration::from_secs(3));

    // A zero TTL is rejected by the store, failing the whole batch.
    let err = cache
        .get_resource("AA-1", Duration::from_secs(1), || async {
            Ok::<_, String>(Computed::new("X", Duration::ZERO))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MemoError::BatchWrite(_)), "unexpected error: {err}");

    assert!(server.ttl("gdsp/lock:AA-1").is_some());
    assert!(server.ttl("gdsp:AA-1").is_none());

    sleep(Duration::from_secs(4)).await;
    assert!(server.ttl("gdsp/lock:AA-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn close_fails_waiters() {
    let server = MemoryServer::new();
    let leader = instance(&server, Duration::from_secs(10));
    let follower = instance(&server, Duration::from_secs(10));

    let leading = tokio::spawn({
        let leader = Arc::clone(&leader);
        async move {
            leader
                .get_resource("AA-1", Duration::from_secs(10), || async {
                    sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(Computed::new("X", LONG_TTL))
                })
                .await
        }
    });
    sleep(Duration::from_millis(10)).await;

    let waiting = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move {
            follower
                .get_resource("AA-1", Duration::from_secs(10), || async {
                    Err::<Computed, _>("must not be called")
                })
                .await
        }
    });
    sleep(Duration::from_millis(100)).await;
    follower.close();

    assert!(matches!(waiting.await.unwrap(), Err(MemoError::DispatcherGone { .. })));
    let late = follower
        .get_resource("AA-1", Duration::from_secs(10), || async {
            Err::<Computed, _>("must not be called")
        })
        .await;
    assert!(matches!(late, Err(MemoError::DispatcherGone { .. })));

    // Leaders are unaffected, as are hits once the value is there.
    assert_eq!(leading.await.unwrap().unwrap(), "X");
    let hit = follower
        .get_resource("AA-1", Duration::from_secs(1), || async {
            Err::<Computed, _>("must not be called")
        })
        .await;
    assert_eq!(hit.unwrap(), "X");
}

#[tokio::test]
async fn same_connection_for_both_roles_is_rejected() {
    let server = MemoryServer::new();
    let connection = Arc::new(server.connect());

    let Err(err) = Cache::builder()
        .store(Arc::clone(&connection))
        .subscriber(Arc::clone(&connection))
        .build()
    else {
        panic!("a shared connection must be rejected");
    };
    assert!(matches!(err, MemoError::Configuration(_)));

    let Err(err) = Cache::from_config(Arc::clone(&connection), connection, &MemoConfig::default())
    else {
        panic!("a shared connection must be rejected");
    };
    assert!(matches!(err, MemoError::Configuration(_)));

    // Two connections to the same server are fine.
    assert!(Cache::builder()
        .store(Arc::new(server.connect()))
        .subscriber(Arc::new(server.connect()))
        .build()
        .is_ok());
}

#[tokio::test]
async fn empty_tag_is_rejected() {
    let server = MemoryServer::new();
    let Err(err) = Cache::builder()
        .store(Arc::new(server.connect()))
        .subscriber(Arc::new(server.connect()))
        .resource_tag("")
        .build()
    else {
        panic!("an empty tag must be rejected");
    };
    assert!(matches!(err, MemoError::Configuration(_)));
}

#[tokio::test]
async fn listen_subscribes_once() {
    let server = MemoryServer::new();
    let subscriber = Arc::new(server.connect());
    let cache = Cache::builder()
        .store(Arc::new(server.connect()))
        .subscriber(Arc::clone(&subscriber))
        .build()
        .unwrap();

    cache.listen().await.unwrap();
    cache.listen().await.unwrap();

    assert_eq!(server.subscriptions(), 1);
    assert!(subscriber.is_subscriber());
    assert!(matches!(subscriber.get("memo:x").await, Err(StoreError::SubscriberMode)));
}

#[tokio::test(start_paused = true)]
async fn built_from_config() {
    let server = MemoryServer::new();
    let config = MemoConfig {
        resource_tag: "cfg".to_string(),
        lock_timeout_secs: 3,
        ..MemoConfig::default()
    };
    let cache = Cache::from_config(Arc::new(server.connect()), Arc::new(server.connect()), &config).unwrap();

    assert_eq!(cache.lock_timeout(), Duration::from_secs(3));
    assert_eq!(cache.wait_timeout(), Duration::from_secs(30));
    assert_eq!(cache.keys().lock_key("x"), "cfg/lock:x");

    let value = cache
        .fetch("x", || async { Ok::<_, String>(Computed::new("42", LONG_TTL)) })
        .await
        .unwrap();
    assert_eq!(value, "42");
    assert!(server.ttl("cfg:x").is_some());
}

#[tokio::test(start_paused = true)]
async fn unbounded_lease_and_ttl_are_accepted() {
    let server = MemoryServer::new();
    let config = MemoConfig {
        resource_tag: TAG.to_string(),
        lock_timeout_secs: u64::MAX,
        ..MemoConfig::default()
    };
    let cache = Cache::from_config(Arc::new(server.connect()), Arc::new(server.connect()), &config).unwrap();

    let value = cache
        .get_resource("AA-1", Duration::from_secs(1), || async {
            Ok::<_, String>(Computed::new("forever", Duration::MAX))
        })
        .await
        .unwrap();
    assert_eq!(value, "forever");
    assert!(server.ttl("gdsp/lock:AA-1").is_none());
    assert_eq!(server.len(), 2);
}
