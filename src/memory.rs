//! In-process backend.
//!
//! [`MemoryServer`] plays the role of a shared key-value server; [`MemoryConnection`]s are clients of it. Entries
//! expire according to the tokio clock, which makes the backend usable with a paused test runtime. The transport
//! rule that a connection subscribed to a pattern can't be used for anything else is enforced as well.
//!
//! Handy for tests, demos and single-process deployments. Multiple [`MemoCache`](crate::MemoCache) instances
//! connected to the same server behave like independent processes sharing a real store.

use async_trait::async_trait;
use glob::Pattern;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use crate::error::StoreError;
use crate::traits::CacheStore;
use crate::traits::NotificationSource;
use crate::types::BatchOp;
use crate::types::Notification;
use crate::types::NotificationStream;
use crate::types::StoreResult;

#[derive(Debug)]
struct StoredValue {
    value:      String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct PatternSubscriber {
    connection: u64,
    pattern:    String,
    matcher:    Pattern,
    tx:         mpsc::UnboundedSender<Notification>,
}

#[derive(Debug, Default)]
struct ServerState {
    // Lock order: entries, then subscribers.
    entries:         Mutex<HashMap<String, StoredValue>>,
    subscribers:     Mutex<Vec<PatternSubscriber>>,
    next_connection: AtomicU64,
}

impl ServerState {
    fn live_entry<'a>(entries: &'a mut HashMap<String, StoredValue>, key: &str) -> Option<&'a mut StoredValue> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|v| !v.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn publish(&self, channel: &str, message: &str) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut receivers = 0;
        subscribers.retain(|sub| {
            if !sub.matcher.matches(channel) {
                return !sub.tx.is_closed();
            }
            let sent = sub
                .tx
                .send(Notification {
                    pattern: sub.pattern.clone(),
                    channel: channel.to_string(),
                    payload: message.to_string(),
                })
                .is_ok();
            if sent {
                receivers += 1;
            }
            sent
        });
        trace!("published to {channel}; receivers={receivers}");
        receivers
    }
}

// An expiration beyond what the clock can represent means no expiration.
fn check_ttl(ttl: Duration, command: &str) -> StoreResult<Option<Instant>> {
    if ttl.is_zero() {
        return Err(StoreError::Backend(format!("invalid expire time in '{command}' command")));
    }
    Ok(Instant::now().checked_add(ttl))
}

/// Shared in-memory key-value server with pattern pub/sub.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            id:              self.state.next_connection.fetch_add(1, Ordering::Relaxed),
            state:           Arc::clone(&self.state),
            subscriber_mode: AtomicBool::new(false),
            closed:          AtomicBool::new(false),
        }
    }

    /// Remaining time to live of a key, if it exists and has an expiration.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.state.entries.lock();
        let entry = ServerState::live_entry(&mut entries, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.state.entries.lock();
        entries.retain(|_, v| v.is_live(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of active pattern subscriptions across all connections.
    pub fn subscriptions(&self) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers.len()
    }
}

/// A client connection to a [`MemoryServer`].
pub struct MemoryConnection {
    id:              u64,
    state:           Arc<ServerState>,
    subscriber_mode: AtomicBool,
    closed:          AtomicBool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_subscriber(&self) -> bool {
        self.subscriber_mode.load(Ordering::Acquire)
    }

    /// Close the connection. Its subscription streams end; further commands fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.state.subscribers.lock().retain(|sub| sub.connection != self.id);
    }

    fn check_regular(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        }
        else if self.is_subscriber() {
            Err(StoreError::SubscriberMode)
        }
        else {
            Ok(())
        }
    }
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("subscriber_mode", &self.is_subscriber())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_regular()?;
        let mut entries = self.state.entries.lock();
        Ok(ServerState::live_entry(&mut entries, key).map(|v| v.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_regular()?;
        let expires_at = check_ttl(ttl, "set")?;
        self.state.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value:      value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_regular()?;
        let expires_at = check_ttl(ttl, "set")?;
        let mut entries = self.state.entries.lock();
        if ServerState::live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value:      value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_regular()?;
        self.state.entries.lock().remove(key);
        Ok(())
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_regular()?;
        let expires_at = check_ttl(ttl, "expire")?;
        let mut entries = self.state.entries.lock();
        Ok(match ServerState::live_entry(&mut entries, key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        })
    }

    async fn exec_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        self.check_regular()?;

        // Validate everything first so that a bad command leaves no partial effects.
        let mut expirations = Vec::with_capacity(ops.len());
        for op in &ops {
            expirations.push(match op {
                BatchOp::Set { ttl, .. } => check_ttl(*ttl, "set")?,
                BatchOp::Publish { .. } => None,
            });
        }

        let mut entries = self.state.entries.lock();
        for (op, expires_at) in ops.into_iter().zip(expirations) {
            match op {
                BatchOp::Set { key, value, .. } => {
                    entries.insert(key, StoredValue { value, expires_at });
                }
                BatchOp::Publish { channel, message } => {
                    self.state.publish(&channel, &message);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for MemoryConnection {
    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let matcher = compile_pattern(pattern)?;
        self.subscriber_mode.store(true, Ordering::Release);

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().push(PatternSubscriber {
            connection: self.id,
            pattern: pattern.to_string(),
            matcher,
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Compile a subscription pattern.
///
/// Subscription patterns follow the Redis flavor of globs: `[^a-z]` negates a class and `\` escapes the next char.
/// Both are rewritten into [`glob::Pattern`] syntax. Runs of `*` collapse into one. Escapes inside a class are not
/// supported. Unlike Redis, a malformed pattern is refused instead of being matched literally.
pub fn compile_pattern(pattern: &str) -> StoreResult<Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped) => translated.push_str(&Pattern::escape(escaped.encode_utf8(&mut [0; 4]))),
                None => translated.push('\\'),
            },
            '*' => {
                while chars.next_if_eq(&'*').is_some() {}
                translated.push('*');
            }
            '[' => {
                translated.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    translated.push('!');
                }
            }
            _ => translated.push(ch),
        }
    }

    Pattern::new(&translated).map_err(|err| StoreError::Backend(format!("invalid pattern '{pattern}': {err}")))
}
