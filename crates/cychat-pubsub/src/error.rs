use thiserror::Error;

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}
