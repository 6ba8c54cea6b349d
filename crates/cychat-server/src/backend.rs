//! Collaborators a chat session relies on: identity and room resolution,
//! message persistence, moderation and presence.
//!
//! The session code only sees the traits. [`SqliteBackend`] implements them
//! on top of `cychat-store`, running every call on the blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use cychat_shared::{ChatStatus, MessageTarget, RoomId, UserId, UserSnapshot};
use cychat_store::{Database, NewMessage, Room, RoomMember, StoreError, StoredMessage, User};

/// Structured soft failure returned by collaborator calls.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Not a member of this room")]
    NotMember,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserNotFound => Self::NotFound("User"),
            StoreError::RoomNotFound => Self::NotFound("Room"),
            StoreError::NotFound => Self::NotFound("Record"),
            StoreError::NotMember => Self::NotMember,
            StoreError::AlreadyMember | StoreError::EmptyMessage | StoreError::SelfBan => {
                Self::Rejected(e.to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Build the session identity for a stored user.
pub fn snapshot_of(user: &User) -> UserSnapshot {
    UserSnapshot {
        id: user.id,
        nickname: user.nickname.clone(),
        email: user.email.clone(),
        user_role: user.user_role.clone(),
        admin: user.is_admin(),
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserSnapshot>, BackendError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserSnapshot>, BackendError>;
}

#[async_trait]
pub trait RoomResolver: Send + Sync {
    async fn find_room(&self, name: &str) -> Result<Option<Room>, BackendError>;

    async fn find_membership(
        &self,
        user: UserId,
        room: RoomId,
    ) -> Result<Option<RoomMember>, BackendError>;
}

#[async_trait]
pub trait MessagePersistence: Send + Sync {
    async fn persist_direct(
        &self,
        sender: UserId,
        receiver: UserId,
        content: String,
        message_type: String,
        media: Option<String>,
    ) -> Result<StoredMessage, BackendError>;

    async fn persist_room(
        &self,
        sender: UserId,
        room: RoomId,
        content: String,
        message_type: String,
        media: Option<String>,
    ) -> Result<StoredMessage, BackendError>;
}

#[async_trait]
pub trait Moderation: Send + Sync {
    async fn ban(&self, admin: UserId, target_email: &str, room_name: &str)
        -> Result<(), BackendError>;

    async fn unban(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<(), BackendError>;
}

#[async_trait]
pub trait Presence: Send + Sync {
    /// May be a no-op.
    async fn set_presence(&self, user: UserId, status: ChatStatus) -> Result<(), BackendError>;
}

/// Everything a session needs from the outside world.
pub trait ChatBackend:
    IdentityResolver + RoomResolver + MessagePersistence + Moderation + Presence
{
}

impl<T> ChatBackend for T where
    T: IdentityResolver + RoomResolver + MessagePersistence + Moderation + Presence
{
}

/// Opens one backend handle per WebSocket session.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn ChatBackend>, BackendError>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// Session-scoped store handle.
pub struct SqliteBackend {
    db: Arc<Mutex<Database>>,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard).map_err(BackendError::from)
        })
        .await
        .map_err(|e| BackendError::Storage(format!("task join error: {}", e)))?
    }
}

#[async_trait]
impl IdentityResolver for SqliteBackend {
    async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserSnapshot>, BackendError> {
        self.run(move |db| Ok(db.find_user_by_id(id)?.as_ref().map(snapshot_of)))
            .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserSnapshot>, BackendError> {
        let email = email.to_string();
        self.run(move |db| Ok(db.find_user_by_email(&email)?.as_ref().map(snapshot_of)))
            .await
    }
}

#[async_trait]
impl RoomResolver for SqliteBackend {
    async fn find_room(&self, name: &str) -> Result<Option<Room>, BackendError> {
        let name = name.to_string();
        self.run(move |db| db.find_room_by_name(&name)).await
    }

    async fn find_membership(
        &self,
        user: UserId,
        room: RoomId,
    ) -> Result<Option<RoomMember>, BackendError> {
        self.run(move |db| db.find_membership(room, user)).await
    }
}

#[async_trait]
impl MessagePersistence for SqliteBackend {
    async fn persist_direct(
        &self,
        sender: UserId,
        receiver: UserId,
        content: String,
        message_type: String,
        media: Option<String>,
    ) -> Result<StoredMessage, BackendError> {
        let msg = NewMessage {
            sender,
            target: MessageTarget::Direct { receiver },
            content,
            message_type,
            media,
        };
        self.run(move |db| db.send_direct_message(&msg)).await
    }

    async fn persist_room(
        &self,
        sender: UserId,
        room: RoomId,
        content: String,
        message_type: String,
        media: Option<String>,
    ) -> Result<StoredMessage, BackendError> {
        let msg = NewMessage {
            sender,
            target: MessageTarget::Room { room_id: room },
            content,
            message_type,
            media,
        };
        self.run(move |db| db.send_room_message(&msg)).await
    }
}

#[async_trait]
impl Moderation for SqliteBackend {
    async fn ban(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<(), BackendError> {
        let (email, room) = (target_email.to_string(), room_name.to_string());
        self.run(move |db| db.ban_member(admin, &email, &room).map(|_| ()))
            .await
    }

    async fn unban(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<(), BackendError> {
        let (email, room) = (target_email.to_string(), room_name.to_string());
        self.run(move |db| db.unban_member(admin, &email, &room).map(|_| ()))
            .await
    }
}

#[async_trait]
impl Presence for SqliteBackend {
    async fn set_presence(&self, user: UserId, status: ChatStatus) -> Result<(), BackendError> {
        self.run(move |db| db.set_chat_status(user, status).map(|_| ()))
            .await
    }
}

/// Opens a fresh [`Database`] handle on the shared file for every session.
pub struct SqliteBackendFactory {
    path: PathBuf,
}

impl SqliteBackendFactory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl BackendFactory for SqliteBackendFactory {
    async fn open_session(&self) -> Result<Arc<dyn ChatBackend>, BackendError> {
        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || Database::open_at(&path))
            .await
            .map_err(|e| BackendError::Storage(format!("task join error: {}", e)))??;
        Ok(Arc::new(SqliteBackend::new(db)))
    }
}
