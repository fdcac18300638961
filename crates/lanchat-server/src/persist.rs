//! Fire-and-forget message persistence.
//!
//! Every write goes through one dedicated writer thread fed by a channel, so
//! delivery never waits on SQLite and rows land in submission order. Reads
//! take the shared connection directly after a [`Persistence::flush`]
//! barrier.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use chrono::{DateTime, Utc};
use lanchat_shared::transfer::is_transfer_payload;
use lanchat_shared::ConversationId;
use lanchat_store::{Database, StoreError, StoredMessage};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The database handle shared by the writer thread, the unread tracker and
/// the HTTP plane.
pub type SharedDb = Arc<Mutex<Database>>;

/// Lock the shared database. A panic on another thread does not leave the
/// connection in an unusable state, so poisoning is ignored.
pub fn lock_db(db: &SharedDb) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-behind copy of an unread counter change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnreadChange {
    Increment {
        user: String,
        conversation: ConversationId,
    },
    Reset {
        user: String,
        conversation: ConversationId,
    },
    Forget {
        user: String,
    },
}

enum WriteOp {
    Message {
        conversation: ConversationId,
        sender: String,
        text: String,
        at: DateTime<Utc>,
    },
    RegisterUser {
        name: String,
        at: DateTime<Utc>,
    },
    Unread(UnreadChange),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Persistence {
    tx: mpsc::Sender<WriteOp>,
    db: SharedDb,
    max_bytes: usize,
}

impl Persistence {
    /// Start the writer thread. It exits once every clone is dropped.
    pub fn spawn(db: SharedDb, max_bytes: usize) -> Self {
        let (tx, rx) = mpsc::channel::<WriteOp>();
        let writer_db = db.clone();

        if let Err(e) = thread::Builder::new()
            .name("lanchat-persist".into())
            .spawn(move || writer_loop(writer_db, rx))
        {
            warn!(error = %e, "failed to start persistence writer");
        }

        Self { tx, db, max_bytes }
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    /// Whether `text` is eligible for history at all.
    pub fn accepts(&self, text: &str) -> bool {
        !is_transfer_payload(text) && text.len() <= self.max_bytes
    }

    /// Queue a message. Transfer frames and oversized payloads are skipped.
    pub fn save(&self, conversation: &ConversationId, sender: &str, text: &str) {
        if !self.accepts(text) {
            debug!(conv = %conversation, len = text.len(), "not persisting payload");
            return;
        }
        let op = WriteOp::Message {
            conversation: conversation.clone(),
            sender: sender.to_string(),
            text: text.to_string(),
            at: Utc::now(),
        };
        if self.tx.send(op).is_err() {
            warn!(conv = %conversation, "persistence writer is gone, message dropped");
        }
    }

    /// Record a successful join in the registered-user set.
    pub fn register_user(&self, name: &str) {
        let op = WriteOp::RegisterUser {
            name: name.to_string(),
            at: Utc::now(),
        };
        if self.tx.send(op).is_err() {
            warn!(user = %name, "persistence writer is gone, registration dropped");
        }
    }

    /// Queue an unread counter change for the durable copy.
    pub fn record_unread(&self, change: UnreadChange) {
        if self.tx.send(WriteOp::Unread(change)).is_err() {
            warn!("persistence writer is gone, unread change dropped");
        }
    }

    /// Resolve once everything queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// The `limit` most recent records of a conversation, oldest first.
    pub async fn load_recent(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.flush().await;
        let db = self.db.clone();
        let conversation = conversation.clone();
        tokio::task::spawn_blocking(move || lock_db(&db).recent_messages(&conversation, limit))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn writer_loop(db: SharedDb, rx: mpsc::Receiver<WriteOp>) {
    debug!("persistence writer started");
    for op in rx {
        match op {
            WriteOp::Message {
                conversation,
                sender,
                text,
                at,
            } => {
                if let Err(e) = lock_db(&db).append_message(&conversation, &sender, &text, at) {
                    warn!(conv = %conversation, error = %e, "failed to persist message");
                }
            }
            WriteOp::RegisterUser { name, at } => {
                if let Err(e) = lock_db(&db).touch_user(&name, at) {
                    warn!(user = %name, error = %e, "failed to register user");
                }
            }
            WriteOp::Unread(change) => {
                let db = lock_db(&db);
                let result = match &change {
                    UnreadChange::Increment { user, conversation } => {
                        db.increment_unread(user, conversation)
                    }
                    UnreadChange::Reset { user, conversation } => db.reset_unread(user, conversation),
                    UnreadChange::Forget { user } => db.clear_unread_for(user),
                };
                if let Err(e) = result {
                    warn!(?change, error = %e, "failed to persist unread counter");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("persistence writer stopped");
}
