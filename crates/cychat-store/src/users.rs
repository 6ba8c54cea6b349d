//! Lookups and presence updates for [`User`] records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use cychat_shared::{ChatStatus, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::{NewUser, User};

const USER_COLUMNS: &str =
    "id, nickname, email, phone_number, user_role, chat_status, created_at";

impl Database {
    /// Register a user. Account creation belongs to the auth service; this
    /// exists for seeding and tests.
    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        self.conn().execute(
            "INSERT INTO users (nickname, email, phone_number, user_role, chat_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.nickname,
                user.email,
                user.phone_number,
                user.user_role,
                ChatStatus::Offline.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = UserId(self.conn().last_insert_rowid());
        self.find_user_by_id(id)?.ok_or(crate::StoreError::NotFound)
    }

    pub fn find_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email.trim()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Record a user's presence. Returns `false` when the user is unknown.
    pub fn set_chat_status(&self, id: UserId, status: ChatStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET chat_status = ?1 WHERE id = ?2",
            params![status.as_str(), id.0],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let status_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let chat_status = status_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(User {
        id: UserId(row.get(0)?),
        nickname: row.get(1)?,
        email: row.get(2)?,
        phone_number: row.get(3)?,
        user_role: row.get(4)?,
        chat_status,
        created_at: parse_timestamp(6, &created_str)?,
    })
}
