use std::path::PathBuf;

use lanchat_shared::{AuthError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential error: {0}")]
    Auth(#[from] AuthError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("transfer of {0} was canceled")]
    Canceled(String),

    #[error("connection closed")]
    Closed,
}
