use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use thiserror::Error;

use crate::subnets::{SubnetError, SubnetHolder};

/// Fixed payload carried by every invalidation message. Subscribers ignore
/// the content entirely; any message means "reload both lists".
const RELOAD_PAYLOAD: &str = "reload";

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Failed to publish subnet update: {0}")]
    PublishError(#[from] redis::RedisError),
    #[error("Subnet reload failed: {0}")]
    ReloadError(#[from] SubnetError),
    #[error("subnet update channel closed")]
    SubscriberTerminated,
}

/// Tells every gateway replica that the subnet lists changed.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn publish(&self) -> Result<(), UpdateError>;
}

/// Single-process variant: publishing reloads the holder directly, so a
/// mutation is visible to the next check as soon as `publish` returns.
pub struct LocalPublisher {
    holder: Arc<SubnetHolder>,
}

impl LocalPublisher {
    pub fn new(holder: Arc<SubnetHolder>) -> LocalPublisher {
        LocalPublisher { holder }
    }
}

#[async_trait]
impl UpdatePublisher for LocalPublisher {
    async fn publish(&self) -> Result<(), UpdateError> {
        self.holder.reload().await?;
        Ok(())
    }
}

/// Broadcast variant: publishing sends the sentinel payload on a named
/// channel and every replica's subscriber reacts by reloading.
pub struct RedisPublisher {
    conn: ConnectionManager,
    channel: String,
}

impl RedisPublisher {
    pub async fn new(client: redis::Client, channel: String) -> Result<RedisPublisher, UpdateError> {
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(RedisPublisher { conn, channel })
    }
}

#[async_trait]
impl UpdatePublisher for RedisPublisher {
    async fn publish(&self) -> Result<(), UpdateError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(RELOAD_PAYLOAD)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Long-running receive loop for the broadcast channel. Exits cleanly on
/// shutdown; a closed pub/sub stream or a failed reload is an error the
/// lifecycle treats as a child failure.
pub struct SubnetUpdatesSubscriber {
    client: redis::Client,
    channel: String,
    holder: Arc<SubnetHolder>,
    log: slog::Logger,
}

impl SubnetUpdatesSubscriber {
    pub fn new(
        client: redis::Client,
        channel: String,
        holder: Arc<SubnetHolder>,
        log: slog::Logger,
    ) -> SubnetUpdatesSubscriber {
        SubnetUpdatesSubscriber {
            client,
            channel,
            holder,
            log,
        }
    }

    pub async fn run(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), UpdateError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&self.channel).await?;
        let mut messages = pubsub.on_message();

        slog::info!(self.log, "Subscribed to subnet updates"; "channel" => self.channel.as_str());

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    slog::debug!(self.log, "Subnet update subscriber shutting down");
                    return Ok(());
                }
                message = messages.next() => {
                    match message {
                        Some(_) => {
                            slog::debug!(self.log, "Received subnet update notification");
                            self.holder.reload().await?;
                        }
                        None => return Err(UpdateError::SubscriberTerminated),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet_store::{MemSubnetStore, SubnetStore};
    use crate::subnets::{Decision, ListKind};

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn local_publish_reloads_synchronously() {
        let store = Arc::new(MemSubnetStore::new());
        let holder = Arc::new(SubnetHolder::new(store.clone(), test_log()));
        holder.reload().await.unwrap();

        let publisher = LocalPublisher::new(holder.clone());

        store
            .add(ListKind::Allow, "192.168.2.0/24")
            .await
            .unwrap();
        assert_eq!(
            holder.check("192.168.2.10".parse().unwrap()),
            Decision::Continue
        );

        publisher.publish().await.unwrap();
        assert_eq!(
            holder.check("192.168.2.10".parse().unwrap()),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn local_publish_surfaces_reload_failure() {
        let store = Arc::new(MemSubnetStore::new());
        let holder = Arc::new(SubnetHolder::new(store.clone(), test_log()));
        let publisher = LocalPublisher::new(holder);

        store.add(ListKind::Deny, "bogus").await.unwrap();
        assert!(matches!(
            publisher.publish().await,
            Err(UpdateError::ReloadError(_))
        ));
    }
}
