use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::trace;
use tracing::warn;

use crate::registry::WaiterRegistry;
use crate::types::NotificationStream;

/// The single task draining a pattern subscription into a [`WaiterRegistry`].
///
/// If the subscription stream ends the registry gets closed, failing everybody who is still waiting: nothing would
/// ever wake them up otherwise. Dropping the dispatcher stops the task.
#[derive(Debug)]
pub struct Dispatcher {
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(mut stream: NotificationStream, registry: Arc<WaiterRegistry>) -> Self {
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let delivered = registry.dispatch(&notification.channel, &notification.payload);
                trace!("{} delivered to {delivered} waiter(s)", notification.channel);
            }
            warn!("notification stream has ended, failing pending waiters");
            registry.close();
        });
        Self { task }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use crate::traits::CacheStore;
    use crate::traits::NotificationSource;
    use crate::types::BatchOp;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_to_registered_waiters() {
        let server = MemoryServer::new();
        let sub = server.connect();
        let conn = server.connect();
        let registry = Arc::new(WaiterRegistry::new());
        let _dispatcher = Dispatcher::start(sub.psubscribe("t/notif:*").await.unwrap(), Arc::clone(&registry));

        let (_, rx) = registry.subscribe("t/notif:a");
        conn.exec_batch(vec![BatchOp::Publish {
            channel: "t/notif:a".to_string(),
            message: "X".to_string(),
        }])
        .await
        .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(value, "X");
    }

    #[tokio::test]
    async fn stream_end_closes_registry() {
        let server = MemoryServer::new();
        let sub = server.connect();
        let registry = Arc::new(WaiterRegistry::new());
        let dispatcher = Dispatcher::start(sub.psubscribe("t/notif:*").await.unwrap(), Arc::clone(&registry));

        let (_, rx) = registry.subscribe("t/notif:a");
        sub.close();

        assert!(rx.await.is_err());
        assert!(registry.is_closed());
        tokio::task::yield_now().await;
        drop(dispatcher);
    }
}
