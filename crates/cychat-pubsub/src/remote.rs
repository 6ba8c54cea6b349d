//! Redis-backed broker for deployments running several server processes.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, Msg};
use tracing::{debug, trace};

use cychat_shared::Topic;

use crate::error::PubSubError;
use crate::transport::{Broker, Connection, Delivery, Subscription};

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self, PubSubError> {
        let client = Client::open(url)?;
        Ok(Self { client })
    }

    /// Round-trip a `PING` to check the server is reachable.
    pub async fn ping(&self) -> Result<(), PubSubError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PubSubError::Unreachable(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| PubSubError::Unreachable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, PubSubError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PubSubError::Unreachable(e.to_string()))?;

        Ok(Box::new(RedisConnection {
            client: self.client.clone(),
            conn,
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

pub struct RedisConnection {
    client: Client,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for RedisConnection {
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::ConnectionClosed);
        }

        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic.as_str())
            .arg(payload.as_ref())
            .query_async::<_, i64>(&mut conn)
            .await?;
        trace!(topic = %topic, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>, PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::ConnectionClosed);
        }

        // Redis needs a dedicated connection in subscriber mode.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic.as_str()).await?;
        debug!(topic = %topic, "Subscribed to Redis channel");

        Ok(Box::new(RedisSubscription {
            topic: topic.as_str().to_string(),
            stream: Some(Box::pin(pubsub.into_on_message())),
            pending_ack: true,
        }))
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct RedisSubscription {
    topic: String,
    stream: Option<MessageStream>,
    pending_ack: bool,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(
        &mut self,
        ignore_subscribe_acks: bool,
        wait: Duration,
    ) -> Result<Option<Delivery>, PubSubError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(PubSubError::SubscriptionClosed);
        };

        // `subscribe` only returns once Redis has confirmed the channel.
        if std::mem::take(&mut self.pending_ack) && !ignore_subscribe_acks {
            return Ok(Some(Delivery::SubscribeAck {
                topic: self.topic.clone(),
            }));
        }

        match tokio::time::timeout(wait, stream.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(Delivery::Message {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })),
            Ok(None) => {
                self.stream = None;
                Err(PubSubError::SubscriptionClosed)
            }
        }
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        // Dropping the stream drops the subscriber connection.
        self.stream.take();
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
