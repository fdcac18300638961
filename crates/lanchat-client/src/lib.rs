//! Endpoint library for lanchat front-ends.
//!
//! Opens line-protocol connections (HELLO + AUTH handshake) and runs the
//! File Transfer Coordinator: chunked, resumable, multi-connection file
//! transfers carried inside ordinary chat payloads.

pub mod attachments;
pub mod connection;
pub mod error;
pub mod events;
pub mod transfer;

pub use attachments::{AttachmentIndex, AttachmentRecord};
pub use connection::{connect, Connection, Credentials, Identity, LineReader, LineSender};
pub use error::TransferError;
pub use events::{SendOutcome, SenderPhase, TransferEvent};
pub use transfer::{TransferConfig, TransferCoordinator, TransferTarget};
