//! WebSocket chat sessions.
//!
//! Each accepted socket gets a [`supervisor`] that runs a [`consumer`]
//! (client -> topic) and a [`producer`] (topic -> client) side by side.

pub mod consumer;
pub mod producer;
pub mod session;
pub mod socket;
pub mod supervisor;

pub use session::{SessionError, SessionResources, SessionRoute, SessionTasks};
pub use supervisor::{run_session, SessionEnd};
