//! # lanchat-store
//!
//! Server-side persistence backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the message log,
//! room definitions, registered users, unread counters, settings and
//! attachment metadata. Callers that share it across tasks wrap it in a
//! mutex; the server keeps all writes on one dedicated thread.

pub mod attachments;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod settings;
pub mod unread;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
