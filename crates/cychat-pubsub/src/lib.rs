//! Topic-based publish/subscribe used to fan envelopes out between
//! WebSocket sessions, with an in-process broker and a Redis broker behind
//! the same traits.

pub mod error;
pub mod memory;
pub mod remote;
pub mod select;
pub mod transport;

pub use error::PubSubError;
pub use memory::MemoryBroker;
pub use remote::RedisBroker;
pub use select::{select_broker, BrokerSelection};
pub use transport::{Broker, Connection, Delivery, Subscription};
