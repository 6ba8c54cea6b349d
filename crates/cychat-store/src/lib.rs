//! # cychat-store
//!
//! Relational storage for Cychat, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, rooms,
//! memberships and messages, plus the persistence and moderation rules the
//! chat core relies on.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod moderation;
pub mod rooms;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use moderation::ModerationOutcome;
