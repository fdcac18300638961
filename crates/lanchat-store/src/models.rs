//! Records persisted in the server database.

use chrono::{DateTime, Utc};
use lanchat_shared::ConversationId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One persisted chat line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    /// Monotonic row id; defines the replay order within a conversation.
    pub id: i64,
    pub conversation: ConversationId,
    pub sender: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A room definition as managed by an administrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    /// Display name sent to joiners in `ROOM_NAME`.
    pub name: String,
    /// `None` means the room is open to everybody. `Some` is the complete
    /// allowed set, possibly empty.
    pub members: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A username that has joined at least once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredUser {
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Metadata for a content-addressed upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// Hex BLAKE3 hash of the bytes, also the download id.
    pub hash: String,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}
