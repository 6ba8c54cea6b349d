//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cychat_shared::{ChatStatus, MessageTarget, RoomId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account, as seen by the chat core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
    pub email: String,
    pub phone_number: Option<String>,
    /// `user` or `admin`.
    pub user_role: String,
    pub chat_status: ChatStatus,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.user_role.eq_ignore_ascii_case("admin")
    }
}

/// Fields required to register a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub nickname: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub user_role: String,
}

impl NewUser {
    pub fn new(nickname: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            email: email.into(),
            phone_number: None,
            user_role: "user".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A named group chat. Names are unique, compared case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub room_name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub id: i64,
    pub room_id: RoomId,
    pub member_id: UserId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    NotRead,
    Read,
}

impl ReadStatus {
    pub fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            Self::NotRead
        } else {
            Self::Read
        }
    }

    pub fn as_flag(&self) -> i64 {
        match self {
            Self::NotRead => 0,
            Self::Read => 1,
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub message_type: String,
    pub status: ReadStatus,
    /// URL of an attached file, if any.
    pub media: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub message_type: String,
    pub media: Option<String>,
}
