//! Message persistence and history queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use cychat_shared::{MessageTarget, RoomId, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{NewMessage, ReadStatus, StoredMessage};

const MESSAGE_COLUMNS: &str = "id, sender, receiver, room_id, content, message_type, status, \
                               media, created_at, modified_at";

impl Database {
    /// Insert a message without any validation. Use
    /// [`send_direct_message`](Self::send_direct_message) or
    /// [`send_room_message`](Self::send_room_message) from request paths.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<StoredMessage> {
        let (receiver, room_id) = match msg.target {
            MessageTarget::Direct { receiver } => (Some(receiver.0), None),
            MessageTarget::Room { room_id } => (None, Some(room_id.0)),
        };
        let now = Utc::now().to_rfc3339();

        self.conn().execute(
            "INSERT INTO messages
                (sender, receiver, room_id, content, message_type, status, media, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                msg.sender.0,
                receiver,
                room_id,
                msg.content,
                msg.message_type,
                ReadStatus::NotRead.as_flag(),
                msg.media,
                now,
            ],
        )?;

        let id = self.conn().last_insert_rowid();
        self.get_message_by_id(id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_message_by_id(&self, id: i64) -> Result<Option<StoredMessage>> {
        let msg = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(msg)
    }

    /// Persist a direct message after checking it is not empty and the
    /// receiver exists.
    pub fn send_direct_message(&self, msg: &NewMessage) -> Result<StoredMessage> {
        ensure_not_empty(msg)?;
        let MessageTarget::Direct { receiver } = msg.target else {
            return Err(StoreError::Corrupt("direct message addressed to a room".into()));
        };
        if self.find_user_by_id(receiver)?.is_none() {
            return Err(StoreError::UserNotFound);
        }

        let stored = self.insert_message(msg)?;
        tracing::info!(sender = %msg.sender, %receiver, "direct message stored");
        Ok(stored)
    }

    /// Persist a room message after checking it is not empty, the room
    /// exists and the sender is a member.
    pub fn send_room_message(&self, msg: &NewMessage) -> Result<StoredMessage> {
        ensure_not_empty(msg)?;
        let MessageTarget::Room { room_id } = msg.target else {
            return Err(StoreError::Corrupt("room message addressed to a user".into()));
        };
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM rooms WHERE id = ?1)",
            params![room_id.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::RoomNotFound);
        }
        if self.find_membership(room_id, msg.sender)?.is_none() {
            return Err(StoreError::NotMember);
        }

        let stored = self.insert_message(msg)?;
        tracing::info!(sender = %msg.sender, room = %room_id, "room message stored");
        Ok(stored)
    }

    /// Both directions of a direct conversation, oldest first.
    pub fn conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![a.0, b.0], row_to_message)?;
        collect(rows)
    }

    /// History of a room, oldest first.
    pub fn room_messages(&self, room_id: RoomId) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![room_id.0], row_to_message)?;
        collect(rows)
    }

    /// Mark every unread message from `sender` to `receiver` as read.
    /// Returns the number of rows updated.
    pub fn mark_read(&self, sender: UserId, receiver: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?1, modified_at = ?2
             WHERE sender = ?3 AND receiver = ?4 AND status = ?5",
            params![
                ReadStatus::Read.as_flag(),
                Utc::now().to_rfc3339(),
                sender.0,
                receiver.0,
                ReadStatus::NotRead.as_flag(),
            ],
        )?;
        Ok(affected)
    }

    /// Delete everything `sender` wrote in a room.
    pub fn delete_room_messages_from(&self, sender: UserId, room_id: RoomId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE sender = ?1 AND room_id = ?2",
            params![sender.0, room_id.0],
        )?;
        tracing::info!(%sender, room = %room_id, deleted = affected, "room messages deleted");
        Ok(affected)
    }
}

fn ensure_not_empty(msg: &NewMessage) -> Result<()> {
    let has_media = msg.media.as_deref().is_some_and(|m| !m.is_empty());
    if msg.content.is_empty() && !has_media {
        return Err(StoreError::EmptyMessage);
    }
    Ok(())
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<StoredMessage>>,
) -> Result<Vec<StoredMessage>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let receiver: Option<i64> = row.get(2)?;
    let room_id: Option<i64> = row.get(3)?;
    let status_flag: i64 = row.get(6)?;
    let created_str: String = row.get(8)?;
    let modified_str: String = row.get(9)?;

    let target = match (receiver, room_id) {
        (Some(r), None) => MessageTarget::Direct { receiver: UserId(r) },
        (None, Some(r)) => MessageTarget::Room { room_id: RoomId(r) },
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Integer,
                Box::new(StoreError::Corrupt(
                    "message must have exactly one of receiver or room".into(),
                )),
            ))
        }
    };

    Ok(StoredMessage {
        id: row.get(0)?,
        sender: UserId(row.get(1)?),
        target,
        content: row.get(4)?,
        message_type: row.get(5)?,
        status: ReadStatus::from_flag(status_flag),
        media: row.get(7)?,
        created_at: parse_timestamp(8, &created_str)?,
        modified_at: parse_timestamp(9, &modified_str)?,
    })
}
