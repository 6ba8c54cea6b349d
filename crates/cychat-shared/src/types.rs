use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::TOPIC_SEPARATOR;
use crate::error::ProtocolError;

/// Numeric user identity as issued by the account service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fan-out channel key. Never persisted: it is derived from the two
/// participants of a direct chat or from a room name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Topic shared by both directions of a direct conversation: the two
    /// ids sorted ascending, joined by [`TOPIC_SEPARATOR`].
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{TOPIC_SEPARATOR}{high}"))
    }

    /// Topic of a room: the room name itself.
    pub fn room(name: &str) -> Result<Self, ProtocolError> {
        if name.trim().is_empty() {
            return Err(ProtocolError::InvalidTopic("room name is empty".into()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Addressing of a persisted message. Exactly one mode applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MessageTarget {
    Direct { receiver: UserId },
    Room { room_id: RoomId },
}

/// Presence status of a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Online,
    Offline,
    Busy,
    DontDisturb,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
            Self::DontDisturb => "dont_disturb",
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "busy" => Ok(Self::Busy),
            "dont_disturb" | "don't disturb" => Ok(Self::DontDisturb),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}
