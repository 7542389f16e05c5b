//! Redis pub/sub backplane.
//!
//! Publishing goes over one shared `ConnectionManager`, which reconnects on
//! its own after a dropped link. Each subscription opens its own pub/sub
//! connection, since a connection in subscribe mode cannot issue ordinary
//! commands. A dropped pub/sub connection ends the subscription stream and
//! the hub's pump resubscribes.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures_util::StreamExt;

use super::{Backplane, BackplaneError, Subscription};

#[derive(Clone)]
pub struct RedisBackplane {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBackplane {
    pub async fn connect(redis_url: &str) -> Result<Self, BackplaneError> {
        let client = Client::open(redis_url).map_err(|e| {
            log::error!("Failed to open Redis client for backplane: {e}");
            BackplaneError::Connection(format!("Failed to open Redis client: {e}"))
        })?;
        let publisher = client.get_connection_manager().await.map_err(|e| {
            log::error!("Failed to connect to Redis for backplane: {e}");
            BackplaneError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| BackplaneError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackplaneError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BackplaneError::Subscribe(e.to_string()))?;

        log::info!("Subscribed to backplane topic {topic}");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }
}
