//! Room moderation: banning and re-admitting members.
//!
//! Both operations resolve the room by its lowercased name and require the
//! acting user to be a member of it. A ban wipes the target's messages in
//! the room before removing the membership, inside one transaction.

use cychat_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Room, User};

/// Outcome of a successful moderation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationOutcome {
    pub room: Room,
    pub target: User,
    /// Messages removed as part of a ban. Always zero for unban.
    pub deleted_messages: usize,
}

impl Database {
    pub fn ban_member(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<ModerationOutcome> {
        let (room, target) = self.resolve_moderation(admin, target_email, room_name)?;

        if self.find_membership(room.id, target.id)?.is_none() {
            return Err(StoreError::NotMember);
        }
        if target.id == admin {
            return Err(StoreError::SelfBan);
        }

        let tx = self.conn().unchecked_transaction()?;
        let deleted_messages = self.delete_room_messages_from(target.id, room.id)?;
        self.remove_member(room.id, target.id)?;
        tx.commit()?;

        tracing::info!(
            %admin,
            target = %target.id,
            room = %room.room_name,
            deleted_messages,
            "member banned"
        );
        Ok(ModerationOutcome {
            room,
            target,
            deleted_messages,
        })
    }

    pub fn unban_member(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<ModerationOutcome> {
        let (room, target) = self.resolve_moderation(admin, target_email, room_name)?;

        if self.find_membership(room.id, target.id)?.is_some() {
            return Err(StoreError::AlreadyMember);
        }
        self.add_member(room.id, target.id)?;

        tracing::info!(%admin, target = %target.id, room = %room.room_name, "member unbanned");
        Ok(ModerationOutcome {
            room,
            target,
            deleted_messages: 0,
        })
    }

    fn resolve_moderation(
        &self,
        admin: UserId,
        target_email: &str,
        room_name: &str,
    ) -> Result<(Room, User)> {
        let room_name = room_name.trim().to_lowercase();
        if room_name.is_empty() {
            return Err(StoreError::RoomNotFound);
        }
        let room = self
            .find_room_by_name(&room_name)?
            .ok_or(StoreError::RoomNotFound)?;

        if self.find_membership(room.id, admin)?.is_none() {
            return Err(StoreError::NotMember);
        }

        let target = self
            .find_user_by_email(target_email)?
            .ok_or(StoreError::UserNotFound)?;

        Ok((room, target))
    }
}
