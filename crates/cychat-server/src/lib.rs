//! # cychat-server
//!
//! Real-time chat server for Cychat.
//!
//! - **WebSocket sessions** for direct and room chat, fanned out through a
//!   pub/sub broker (Redis, or in-process when Redis is unavailable)
//! - **Attachment store** for files sent inline over the socket or uploaded
//!   through the REST API
//! - **REST API** (axum) for health checks and attachment upload/download

pub mod api;
pub mod attachments;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod ws;

pub use context::AppContext;
