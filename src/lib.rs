//! # memo-cache
//!
//! Distributed single-flight memoization on top of a key-value store with pattern pub/sub.
//!
//! When a popular cached value expires, every process that needs it would normally recompute it at once. This crate
//! lets exactly one caller per resource, across all processes sharing the store, run the computation. Everybody else
//! waits for the result to be published.
//!
//! # The Protocol
//!
//! For a resource `R` under the namespace tag `T`:
//!
//! 1. Read `T:R`. A hit is returned right away.
//! 2. Try to take the lock `T/lock:R` with a fresh random token and a lease of
//!    [`lock_timeout`](MemoCache::lock_timeout).
//! 3. The winner (the *leader*) runs the computation. The value is stored under `T:R` with the TTL the computation
//!    asked for and published on `T/notif:R`, both in one atomic batch. The lock then expires on its own.
//! 4. Everybody else (the *waiters*) registers for `T/notif:R`, re-reads `T:R` to close the gap between the first
//!    read and the registration, then waits for the notification no longer than they were told to.
//!
//! A failed computation deletes the lock so that the next caller can try again. A computation that may outlive the
//! lease uses [`MemoCache::get_resource_renewable`] and extends it through [`LockRenewer::renew`].
//!
//! # Backends
//!
//! Anything implementing [`CacheStore`] and [`NotificationSource`] can back the cache. [`MemoryServer`] is an
//! in-process server with the same semantics, useful for tests and single-process deployments. With the `redis`
//! feature enabled, `RedisConnection` talks to a Redis server.
//!
//! The subscriber connection is switched into subscription mode and can't issue regular commands anymore. Therefore a
//! cache needs two distinct connections; passing the same one twice is rejected at build time.
//!
//! # Logging
//!
//! Everything is logged with [`tracing`]: cache hits, leadership, and waiting at `debug`; per-notification dispatch at
//! `trace`; lost subscriptions and failed cleanups at `warn`.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod keys;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod registry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::MemoCache;
#[doc(inline)]
pub use config::MemoConfig;
#[doc(inline)]
pub use error::MemoError;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use lock::LockRenewer;
#[doc(inline)]
pub use memory::MemoryServer;
#[cfg(feature = "redis")]
#[doc(inline)]
pub use redis_store::RedisConnection;
#[doc(inline)]
pub use traits::CacheStore;
#[doc(inline)]
pub use traits::NotificationSource;
#[doc(inline)]
pub use types::Computed;

pub mod prelude {
    pub use crate::cache::MemoCache;
    pub use crate::config::MemoConfig;
    pub use crate::error::MemoError;
    pub use crate::error::StoreError;
    pub use crate::lock::LockRenewer;
    pub use crate::memory::MemoryConnection;
    pub use crate::memory::MemoryServer;
    #[cfg(feature = "redis")]
    pub use crate::redis_store::RedisConnection;
    pub use crate::traits::CacheStore;
    pub use crate::traits::NotificationSource;
    pub use crate::types::*;
}
