//! In-process broker: one `tokio::sync::broadcast` channel per topic.
//!
//! Semantics match the Redis broker: fire-and-forget publish, messages to a
//! topic without subscribers are dropped, and every subscription starts
//! with a subscribe acknowledgement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

use cychat_shared::Topic;

use crate::error::PubSubError;
use crate::transport::{Broker, Connection, Delivery, Subscription};

/// Per-subscriber buffer before a slow subscriber starts lagging.
const DEFAULT_TOPIC_CAPACITY: usize = 256;

struct Registry {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl Registry {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Bytes>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the topic entry once nobody listens on it any more.
    fn release(&self, topic: &str) {
        let mut topics = self.topics();
        if topics
            .get(topic)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(topic);
            debug!(topic = %topic, "Removed idle in-memory topic");
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    registry: Arc<Registry>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Number of topics with at least one live subscription.
    pub fn topic_count(&self) -> usize {
        self.registry.topics().len()
    }

    fn open(&self) -> MemoryConnection {
        MemoryConnection {
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, PubSubError> {
        Ok(Box::new(self.open()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryConnection {
    registry: Arc<Registry>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::ConnectionClosed);
        }

        let sender = self.registry.topics().get(topic.as_str()).cloned();
        match sender {
            Some(tx) => {
                let receivers = tx.send(payload).unwrap_or(0);
                trace!(topic = %topic, receivers, "Published in-memory message");
            }
            None => trace!(topic = %topic, "No subscribers, message dropped"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>, PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::ConnectionClosed);
        }

        let rx = {
            let mut topics = self.registry.topics();
            topics
                .entry(topic.as_str().to_string())
                .or_insert_with(|| broadcast::channel(self.registry.capacity).0)
                .subscribe()
        };

        debug!(topic = %topic, "Subscribed to in-memory topic");
        Ok(Box::new(MemorySubscription {
            registry: self.registry.clone(),
            topic: topic.as_str().to_string(),
            rx: Some(rx),
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

pub struct MemorySubscription {
    registry: Arc<Registry>,
    topic: String,
    rx: Option<broadcast::Receiver<Bytes>>,
    pending_ack: bool,
}

impl MemorySubscription {
    fn release(&mut self) {
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.registry.release(&self.topic);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(
        &mut self,
        ignore_subscribe_acks: bool,
        wait: Duration,
    ) -> Result<Option<Delivery>, PubSubError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(PubSubError::SubscriptionClosed);
        };

        if std::mem::take(&mut self.pending_ack) && !ignore_subscribe_acks {
            return Ok(Some(Delivery::SubscribeAck {
                topic: self.topic.clone(),
            }));
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(payload)) => {
                    return Ok(Some(Delivery::Message {
                        topic: self.topic.clone(),
                        payload,
                    }))
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, messages lost");
                }
                Ok(Err(RecvError::Closed)) => return Err(PubSubError::SubscriptionClosed),
            }
        }
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        self.release();
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    fn topic(name: &str) -> Topic {
        Topic::room(name).unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect().await.unwrap();
        let a = broker.connect().await.unwrap();
        let b = broker.connect().await.unwrap();

        let mut sub_a = a.subscribe(&topic("general")).await.unwrap();
        let mut sub_b = b.subscribe(&topic("general")).await.unwrap();

        publisher
            .publish(&topic("general"), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            let delivery = sub.next_message(true, WAIT).await.unwrap().unwrap();
            assert_eq!(delivery.payload().unwrap().as_ref(), b"hello");
        }
    }

    #[tokio::test]
    async fn test_subscribe_ack_comes_first_unless_ignored() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();

        let mut sub = conn.subscribe(&topic("acks")).await.unwrap();
        let first = sub.next_message(false, WAIT).await.unwrap();
        assert_eq!(
            first,
            Some(Delivery::SubscribeAck {
                topic: "acks".into()
            })
        );

        let mut quiet = conn.subscribe(&topic("acks")).await.unwrap();
        assert_eq!(quiet.next_message(true, WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poll_returns_none_when_idle() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut sub = conn.subscribe(&topic("idle")).await.unwrap();

        let polled = sub
            .next_message(true, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut sub = conn.subscribe(&topic("one")).await.unwrap();

        conn.publish(&topic("two"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(sub.next_message(true, Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(conn.is_closed());
        assert!(matches!(
            conn.publish(&topic("t"), Bytes::new()).await,
            Err(PubSubError::ConnectionClosed)
        ));
        assert!(conn.subscribe(&topic("t")).await.is_err());
    }

    #[tokio::test]
    async fn test_last_close_removes_topic() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();

        let mut first = conn.subscribe(&topic("room")).await.unwrap();
        let second = conn.subscribe(&topic("room")).await.unwrap();
        assert_eq!(broker.topic_count(), 1);

        first.close().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(broker.topic_count(), 1);
        assert!(first.next_message(true, WAIT).await.is_err());

        drop(second);
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_lost_messages() {
        let broker = MemoryBroker::with_capacity(2);
        let conn = broker.connect().await.unwrap();
        let mut sub = conn.subscribe(&topic("busy")).await.unwrap();

        for i in 0..5u8 {
            conn.publish(&topic("busy"), Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        let delivery = sub.next_message(true, WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.payload().unwrap().as_ref(), &[3u8]);
    }
}
