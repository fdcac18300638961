//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration on a LAN.

use std::net::SocketAddr;
use std::path::PathBuf;

use lanchat_shared::constants::{
    DEFAULT_CHAT_PORT, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT, DEFAULT_ROOM, MAX_BLOB_SIZE,
    MAX_HISTORY_LIMIT, MAX_PERSIST_BYTES,
};

/// Where unread counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadBackendKind {
    Sqlite,
    Memory,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Line-protocol listener.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:5001`
    pub listen_addr: SocketAddr,

    /// Socket address for the HTTP (axum) control plane.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Holds `lanchat.db` and the `attachments/` directory.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Room every implicit join lands in. Always open, never renamed.
    /// Env: `DEFAULT_ROOM`
    pub default_room: String,

    /// Enables the HMAC scheme.
    /// Env: `AUTH_SECRET`
    pub auth_secret: Option<String>,

    /// Enables the signed-token scheme. Wins over `AUTH_SECRET`.
    /// Env: `JWT_SECRET`
    pub jwt_secret: Option<String>,

    /// Password for `POST /admin/login`. Admin API disabled when unset.
    /// Env: `ADMIN_PASSWORD`
    pub admin_password: Option<String>,

    /// Env: `MAX_PERSIST_BYTES`
    pub max_persist_bytes: usize,

    /// Default `HIST` depth.
    /// Env: `HISTORY_LIMIT`
    pub history_limit: usize,

    /// Maximum attachment upload size in bytes (50 MiB).
    /// Env: `MAX_BLOB_SIZE`
    pub max_blob_size: usize,

    /// Env: `UNREAD_BACKEND` (`sqlite` | `memory`)
    pub unread_backend: UnreadBackendKind,

    /// Initial retention in days, 0 keeps history forever. A value saved
    /// through the admin API takes precedence after the first change.
    /// Env: `RETENTION_DAYS`
    pub retention_days: u32,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("http_addr", &self.http_addr)
            .field("data_dir", &self.data_dir)
            .field("default_room", &self.default_room)
            .field("auth_secret", &self.auth_secret.as_ref().map(|_| "<set>"))
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<set>"))
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<set>"))
            .field("max_persist_bytes", &self.max_persist_bytes)
            .field("history_limit", &self.history_limit)
            .field("max_blob_size", &self.max_blob_size)
            .field("unread_backend", &self.unread_backend)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_CHAT_PORT).into(),
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_dir: PathBuf::from("./data"),
            default_room: DEFAULT_ROOM.to_string(),
            auth_secret: None,
            jwt_secret: None,
            admin_password: None,
            max_persist_bytes: MAX_PERSIST_BYTES,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_blob_size: MAX_BLOB_SIZE,
            unread_backend: UnreadBackendKind::Sqlite,
            retention_days: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }

        if let Some(room) = lookup("DEFAULT_ROOM") {
            let room = room.trim();
            if room.is_empty() || room.contains(char::is_whitespace) {
                tracing::warn!(value = %room, "Invalid DEFAULT_ROOM, using default");
            } else {
                config.default_room = room.to_string();
            }
        }

        config.auth_secret = non_empty(lookup("AUTH_SECRET"));
        config.jwt_secret = non_empty(lookup("JWT_SECRET"));
        config.admin_password = non_empty(lookup("ADMIN_PASSWORD"));

        if let Some(n) = parse_number(&lookup, "MAX_PERSIST_BYTES") {
            config.max_persist_bytes = n;
        }

        if let Some(n) = parse_number(&lookup, "HISTORY_LIMIT") {
            if n == 0 || n > MAX_HISTORY_LIMIT {
                tracing::warn!(value = n, max = MAX_HISTORY_LIMIT, "HISTORY_LIMIT out of range, clamping");
            }
            config.history_limit = n.clamp(1, MAX_HISTORY_LIMIT);
        }

        if let Some(n) = parse_number(&lookup, "MAX_BLOB_SIZE") {
            config.max_blob_size = n;
        }

        if let Some(val) = lookup("UNREAD_BACKEND") {
            match val.to_ascii_lowercase().as_str() {
                "sqlite" => config.unread_backend = UnreadBackendKind::Sqlite,
                "memory" => config.unread_backend = UnreadBackendKind::Memory,
                _ => tracing::warn!(value = %val, "Invalid UNREAD_BACKEND, using default"),
            }
        }

        if let Some(n) = parse_number(&lookup, "RETENTION_DAYS") {
            config.retention_days = n as u32;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
