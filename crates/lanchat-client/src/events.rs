use std::path::PathBuf;

use serde::Serialize;

/// Sender-side progress of one outgoing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPhase {
    Idle,
    Querying,
    BeginSent,
    Transferring,
    /// Re-sending unacknowledged chunks, round `n` (1-based).
    Resending(u32),
    Complete,
    Canceled,
}

/// Summary of a finished outgoing transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub name: String,
    pub hash: String,
    pub size: u64,
    /// Offset the transfer started from after the receiver's resume hint.
    pub resumed_from: u64,
    pub chunks_sent: usize,
    pub chunks_resent: usize,
    /// Chunk offsets still unacknowledged when `FILE_END` went out.
    pub unacked: Vec<u64>,
    /// The receiver already held the file; no chunk was sent.
    pub deduplicated: bool,
}

/// Notifications for the consuming layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// An incoming file was moved into the attachment directory.
    Delivered {
        origin: String,
        name: String,
        path: PathBuf,
        size: u64,
        hash: String,
        /// All declared bytes arrived and the content hash matched.
        complete: bool,
    },
    Canceled {
        origin: String,
        name: String,
    },
    SenderFinished {
        target: String,
        outcome: SendOutcome,
    },
}
