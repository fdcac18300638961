/// Room every connection lands in when no room is named.
pub const DEFAULT_ROOM: &str = "general";

/// Default TCP port of the line-protocol listener.
pub const DEFAULT_CHAT_PORT: u16 = 5001;

/// Default HTTP control plane port (server).
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Payloads larger than this are delivered but never persisted (256 KiB).
pub const MAX_PERSIST_BYTES: usize = 262_144;

/// Maximum size of an attachment uploaded over HTTP (50 MiB).
pub const MAX_BLOB_SIZE: usize = 50 * 1024 * 1024;

/// Default number of records replayed by `HIST` when no count is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on a single `HIST` request.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Raw bytes per `FILE_CHUNK` before base64 expansion.
pub const DEFAULT_CHUNK_SIZE: usize = 48 * 1024;

/// Parallel sender connections opened per transfer.
pub const DEFAULT_TRANSFER_LANES: usize = 4;

/// Retry rounds for unacknowledged chunks before finalizing anyway.
pub const DEFAULT_RESEND_ROUNDS: u32 = 2;

/// Times a receiver re-checks completeness after `FILE_END` before
/// finalizing with whatever bytes exist.
pub const DEFAULT_END_RETRIES: u32 = 3;

/// The only algorithm accepted in a signed-token header.
pub const TOKEN_ALGORITHM: &str = "HS256";

/// Prefix of every server-generated system notice.
pub const SYS_PREFIX: &str = "[SYS] ";

/// Marker token that flags a HELLO as an auxiliary transfer lane.
pub const LANE_MARKER: &str = "LANE";
