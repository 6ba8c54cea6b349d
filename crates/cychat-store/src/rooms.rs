//! Rooms and room membership.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use cychat_shared::{RoomId, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Room, RoomMember};

impl Database {
    /// Create a room. Names are stored lowercased.
    pub fn create_room(&self, room_name: &str, description: Option<&str>) -> Result<Room> {
        let name = room_name.trim().to_lowercase();
        self.conn().execute(
            "INSERT INTO rooms (room_name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, Utc::now().to_rfc3339()],
        )?;
        let id = self.conn().last_insert_rowid();
        let room = self.conn().query_row(
            "SELECT id, room_name, description, created_at FROM rooms WHERE id = ?1",
            params![id],
            row_to_room,
        )?;
        Ok(room)
    }

    /// Look up a room by name. Case-insensitive through the `NOCASE`
    /// collation on `rooms.room_name`.
    pub fn find_room_by_name(&self, room_name: &str) -> Result<Option<Room>> {
        let room = self
            .conn()
            .query_row(
                "SELECT id, room_name, description, created_at FROM rooms WHERE room_name = ?1",
                params![room_name.trim()],
                row_to_room,
            )
            .optional()?;
        Ok(room)
    }

    pub fn find_membership(&self, room_id: RoomId, member_id: UserId) -> Result<Option<RoomMember>> {
        let member = self
            .conn()
            .query_row(
                "SELECT id, room_id, member_id, created_at FROM room_members
                 WHERE room_id = ?1 AND member_id = ?2",
                params![room_id.0, member_id.0],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    /// Add a member. Fails with [`StoreError::AlreadyMember`] on duplicates.
    pub fn add_member(&self, room_id: RoomId, member_id: UserId) -> Result<RoomMember> {
        if self.find_membership(room_id, member_id)?.is_some() {
            return Err(StoreError::AlreadyMember);
        }
        self.conn().execute(
            "INSERT INTO room_members (room_id, member_id, created_at) VALUES (?1, ?2, ?3)",
            params![room_id.0, member_id.0, Utc::now().to_rfc3339()],
        )?;
        self.find_membership(room_id, member_id)?
            .ok_or(StoreError::NotFound)
    }

    /// Remove a member. Returns `false` when there was no such membership.
    pub fn remove_member(&self, room_id: RoomId, member_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND member_id = ?2",
            params![room_id.0, member_id.0],
        )?;
        Ok(affected > 0)
    }

    pub fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, room_id, member_id, created_at FROM room_members
             WHERE room_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![room_id.0], row_to_member)?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let created_str: String = row.get(3)?;
    Ok(Room {
        id: RoomId(row.get(0)?),
        room_name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_timestamp(3, &created_str)?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomMember> {
    let created_str: String = row.get(3)?;
    Ok(RoomMember {
        id: row.get(0)?,
        room_id: RoomId(row.get(1)?),
        member_id: UserId(row.get(2)?),
        created_at: parse_timestamp(3, &created_str)?,
    })
}
