//! Types shared by every Cychat crate: identities, topics, the envelope
//! exchanged over WebSockets and pub/sub, and attachment classification.

pub mod constants;
pub mod error;
pub mod files;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use files::FileCategory;
pub use protocol::{Envelope, EnvelopeKind, FileInfo, UserSnapshot};
pub use types::{ChatStatus, MessageTarget, RoomId, Topic, UserId};
