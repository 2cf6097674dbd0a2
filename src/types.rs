use std::fmt::Debug;
use std::pin::Pin;
use std::time::Duration;

use tokio_stream::Stream;

use crate::error::StoreError;

/// What a computation hands back to the cache: the payload and for how long it stays cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Computed {
    pub value: String,
    pub ttl:   Duration,
}

impl Computed {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            ttl,
        }
    }
}

/// A single step of an atomic store batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: String, ttl: Duration },
    Publish { channel: String, message: String },
}

/// A message delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pattern: String,
    pub channel: String,
    pub payload: String,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send + 'static>>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
