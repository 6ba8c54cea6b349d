//! Broker-agnostic publish/subscribe contract.
//!
//! A [`Broker`] hands out one [`Connection`] per WebSocket session; the
//! connection publishes envelopes and opens [`Subscription`]s. Nothing here
//! is pooled: every session connects at accept time and closes at teardown.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use cychat_shared::Topic;

use crate::error::PubSubError;

/// One item pulled from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Broker confirmation that the subscription is active.
    SubscribeAck { topic: String },
    /// A payload published on the topic.
    Message { topic: String, payload: Bytes },
}

impl Delivery {
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Message { payload, .. } => Some(payload),
            Self::SubscribeAck { .. } => None,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection scoped to a single session.
    async fn connect(&self) -> Result<Box<dyn Connection>, PubSubError>;

    /// Short backend name for logs and the health endpoint.
    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError>;

    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>, PubSubError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), PubSubError>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Subscription: Send {
    /// Poll for the next delivery, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when nothing is pending within the window. With
    /// `ignore_subscribe_acks` set, acknowledgements are consumed silently.
    async fn next_message(
        &mut self,
        ignore_subscribe_acks: bool,
        wait: Duration,
    ) -> Result<Option<Delivery>, PubSubError>;

    /// Unsubscribe and release the subscription. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), PubSubError>;

    fn topic(&self) -> &str;
}
