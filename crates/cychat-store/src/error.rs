use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Room not found")]
    RoomNotFound,

    /// The acting user does not belong to the room.
    #[error("Not a member of this room")]
    NotMember,

    #[error("User is already a member of this room")]
    AlreadyMember,

    #[error("Message has neither content nor media")]
    EmptyMessage,

    #[error("A user cannot ban themselves")]
    SelfBan,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored value that does not map back to a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
