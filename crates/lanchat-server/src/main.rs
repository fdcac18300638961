//! # lanchat-server
//!
//! Self-hosted chat server for a LAN or intranet.
//!
//! This binary provides:
//! - **Line protocol listener** (TCP): rooms, direct messages, presence,
//!   history replay, unread counters and relaying of chunked file transfers
//! - **Auth Gate** with either HMAC credentials or signed tokens
//! - **Persistence** of the message log, rooms, users and unread counters in
//!   SQLite, written off the delivery path
//! - **HTTP control plane** (axum) for room/user administration, retention
//!   and content-addressed attachment upload/download
//! - **Retention sweeper** pruning history past the configured age

mod api;
mod auth;
mod blob_store;
mod config;
mod error;
mod hub;
mod persist;
mod retention;
mod session;
mod unread;

#[cfg(test)]
mod testkit;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use lanchat_store::Database;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{AdminSessions, AppState};
use crate::auth::AuthGate;
use crate::blob_store::BlobStore;
use crate::config::{ServerConfig, UnreadBackendKind};
use crate::hub::Hub;
use crate::persist::{lock_db, Persistence, SharedDb};
use crate::retention::RetentionPolicy;
use crate::session::ChatContext;
use crate::unread::UnreadTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lanchat_server=debug")),
        )
        .init();

    info!("Starting lanchat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store and build the subsystems
    // -----------------------------------------------------------------------
    let database = Database::open_in_dir(&config.data_dir)
        .with_context(|| format!("opening database in {}", config.data_dir.display()))?;
    let db: SharedDb = Arc::new(Mutex::new(database));

    let persist = Persistence::spawn(db.clone(), config.max_persist_bytes);

    let unread = match config.unread_backend {
        UnreadBackendKind::Sqlite => {
            let seed = lock_db(&db).all_unread().unwrap_or_else(|e| {
                warn!(error = %e, "Could not load unread counters, starting from zero");
                Vec::new()
            });
            info!(count = seed.len(), "Loaded unread counters");
            UnreadTracker::durable(Arc::new(persist.clone()), seed)
        }
        UnreadBackendKind::Memory => UnreadTracker::in_memory(),
    };

    let hub = Arc::new(Hub::new(&config.default_room, persist, Arc::new(unread)));
    match lock_db(&db).list_rooms() {
        Ok(rooms) => {
            info!(count = rooms.len(), "Loaded room definitions");
            hub.load_rooms(&rooms);
        }
        Err(e) => warn!(error = %e, "Could not load room definitions, starting with defaults"),
    }

    let gate = AuthGate::from_config(&config);
    info!(scheme = gate.scheme(), "Auth gate ready");

    let blob_store = Arc::new(BlobStore::new(config.attachments_dir(), config.max_blob_size).await?);
    let retention = Arc::new(RetentionPolicy::load(&db, config.retention_days));

    let app_state = AppState {
        hub: hub.clone(),
        db: db.clone(),
        blob_store,
        retention: retention.clone(),
        admin: Arc::new(AdminSessions::new(config.admin_password.clone())),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    retention::spawn_sweeper(db.clone(), retention);

    // -----------------------------------------------------------------------
    // 5. Start the chat listener
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding chat listener on {}", config.listen_addr))?;
    let chat = Arc::new(ChatContext::new(hub, gate, config.history_limit));
    tokio::spawn(session::serve(listener, chat));

    // -----------------------------------------------------------------------
    // 6. Run the HTTP control plane (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
