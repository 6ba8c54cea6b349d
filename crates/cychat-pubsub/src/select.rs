//! Broker selection, decided once at startup.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PubSubError;
use crate::memory::MemoryBroker;
use crate::remote::RedisBroker;
use crate::transport::Broker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerSelection {
    /// In-process broker only; sessions in other processes are not reached.
    Memory,
    /// Redis at `url`; startup fails if it cannot be reached.
    Redis { url: String },
    /// Redis at `url` when a `PING` succeeds, otherwise the in-process broker.
    Auto { url: String },
}

impl BrokerSelection {
    /// Parse a `PUBSUB_BACKEND` value (`memory`, `redis`, `auto`).
    pub fn parse(backend: &str, redis_url: String) -> Option<Self> {
        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis { url: redis_url }),
            "auto" => Some(Self::Auto { url: redis_url }),
            _ => None,
        }
    }
}

pub async fn select_broker(selection: &BrokerSelection) -> Result<Arc<dyn Broker>, PubSubError> {
    match selection {
        BrokerSelection::Memory => {
            info!("Using in-process pub/sub broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerSelection::Redis { url } => {
            let broker = RedisBroker::new(url)?;
            broker.ping().await?;
            info!("Using Redis pub/sub broker");
            Ok(Arc::new(broker))
        }
        BrokerSelection::Auto { url } => {
            let probe = match RedisBroker::new(url) {
                Ok(broker) => broker.ping().await.map(|()| broker),
                Err(e) => Err(e),
            };
            match probe {
                Ok(broker) => {
                    info!("Redis reachable, using Redis pub/sub broker");
                    Ok(Arc::new(broker))
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Redis unreachable, falling back to in-process pub/sub broker"
                    );
                    Ok(Arc::new(MemoryBroker::new()))
                }
            }
        }
    }
}
