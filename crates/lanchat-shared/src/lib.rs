//! # lanchat-shared
//!
//! Types shared by the lanchat server and endpoint library: the line
//! protocol, conversation ids, the file-transfer frames that ride inside
//! chat payloads, and the two authentication schemes.

pub mod auth;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod transfer;
pub mod types;

pub use error::{AuthError, ProtocolError};
pub use types::ConversationId;
