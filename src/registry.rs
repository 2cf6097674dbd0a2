use parking_lot::Mutex;
use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tracing::trace;

pub type WaiterId = u64;

/// Pending waiters, per notification channel, in registration order.
///
/// Every waiter is a single-shot signal. A dispatched message consumes all waiters registered for the channel at that
/// moment; those registering afterwards only see the next message. The mutex is never held across an `.await`.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    next_id: AtomicU64,
    closed:  AtomicBool,
    waiters: Mutex<HashMap<String, Vec<(WaiterId, oneshot::Sender<String>)>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next message on `channel`.
    ///
    /// If the registry is closed the returned receiver fails immediately.
    pub fn subscribe(&self, channel: &str) -> (WaiterId, oneshot::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut waiters = self.waiters.lock();
        // Checked under the map lock so that a concurrent close() can't miss this waiter.
        if !self.closed.load(Ordering::Acquire) {
            waiters.entry(channel.to_string()).or_default().push((id, tx));
        }

        (id, rx)
    }

    /// Hand `payload` over to every waiter of `channel`. Returns the number of waiters that actually received it;
    /// those that have given up already are silently skipped.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let Some(waiters) = self.waiters.lock().remove(channel)
        else {
            return 0;
        };

        let mut delivered = 0;
        for (id, tx) in waiters {
            if tx.send(payload.to_string()).is_ok() {
                delivered += 1;
            }
            else {
                trace!("waiter {id} on {channel} is gone");
            }
        }
        delivered
    }

    /// Drop an abandoned waiter. Returns `false` if it has been consumed or removed already.
    pub fn forget(&self, channel: &str, id: WaiterId) -> bool {
        let mut waiters = self.waiters.lock();
        let hash_map::Entry::Occupied(mut entry) = waiters.entry(channel.to_string())
        else {
            return false;
        };

        let list = entry.get_mut();
        let before = list.len();
        list.retain(|(waiter_id, _)| *waiter_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entry.remove();
        }
        removed
    }

    /// Number of waiters currently registered for `channel`.
    pub fn pending(&self, channel: &str) -> usize {
        self.waiters.lock().get(channel).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Drop all waiters and refuse new ones. Pending receivers resolve with an error.
    pub fn close(&self) {
        let mut waiters = self.waiters.lock();
        self.closed.store(true, Ordering::Release);
        waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
