//! Redis backend.
//!
//! Keys carry millisecond expirations (`PX`/`PEXPIRE`) so that sub-second leases and TTLs survive the round trip.
//! Like a Redis client in subscriber mode, a connection used for [`psubscribe`](NotificationSource::psubscribe)
//! refuses regular commands from then on; open a second one for the store role.

use ::redis::aio::MultiplexedConnection;
use ::redis::Client;
use ::redis::Msg;
use ::redis::Script;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::error::StoreError;
use crate::traits::CacheStore;
use crate::traits::NotificationSource;
use crate::types::BatchOp;
use crate::types::Notification;
use crate::types::NotificationStream;
use crate::types::StoreResult;

/// Reset the expiration of `KEYS[1]` to `ARGV[2]` milliseconds only if it holds `ARGV[1]`.
const RENEW_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1]
then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

pub struct RedisConnection {
    client:          Client,
    connection:      MultiplexedConnection,
    renew_script:    Script,
    subscriber_mode: AtomicBool,
}

impl RedisConnection {
    /// Connect to a server, e.g. `redis://127.0.0.1:6379/`.
    pub async fn open(url: &str) -> StoreResult<Self> {
        Self::from_client(Client::open(url)?).await
    }

    pub async fn from_client(client: Client) -> StoreResult<Self> {
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            connection,
            renew_script: Script::new(RENEW_LOCK_SCRIPT),
            subscriber_mode: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> StoreResult<MultiplexedConnection> {
        if self.subscriber_mode.load(Ordering::Acquire) {
            return Err(StoreError::SubscriberMode);
        }
        Ok(self.connection.clone())
    }
}

impl Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("server", &self.client.get_connection_info().addr)
            .field("subscriber_mode", &self.subscriber_mode.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CacheStore for RedisConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let renewed: i64 = self
            .renew_script
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn exec_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(millis(ttl)).ignore();
                }
                BatchOp::Publish { channel, message } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(message).ignore();
                }
            }
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn to_notification(msg: Msg) -> Option<Notification> {
    let payload = msg
        .get_payload::<String>()
        .inspect_err(|err| warn!("non-string payload on {}: {err}", msg.get_channel_name()))
        .ok()?;
    Some(Notification {
        pattern: msg.get_pattern::<String>().unwrap_or_default(),
        channel: msg.get_channel_name().to_string(),
        payload,
    })
}

#[async_trait]
impl NotificationSource for RedisConnection {
    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        self.subscriber_mode.store(true, Ordering::Release);
        Ok(Box::pin(pubsub.into_on_message().filter_map(to_notification)))
    }
}
