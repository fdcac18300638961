//! File Transfer Coordinator.
//!
//! Frames ride inside chat payloads: a transfer to a peer is a run of
//! `DM <peer> FILE_*` lines, a transfer to the room a run of `MSG FILE_*`
//! lines. Replies (`FILE_HAVE`, `FILE_ACK`) always go back by DM to the
//! origin. Bulk chunk data is spread over extra lane connections so one
//! large file does not starve the control connection.

mod receiver;
mod sender;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanchat_shared::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_END_RETRIES, DEFAULT_RESEND_ROUNDS, DEFAULT_TRANSFER_LANES,
};
use lanchat_shared::protocol::{Command, ServerLine};
use lanchat_shared::transfer::{is_transfer_payload, TransferFrame};
use tokio::sync::{
    mpsc, Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
    RwLock,
};
use tracing::{debug, warn};

use crate::attachments::{AttachmentIndex, AttachmentRecord};
use crate::connection::{Identity, LineSender};
use crate::error::TransferError;
use crate::events::{SendOutcome, SenderPhase, TransferEvent};
use receiver::Receiver;
use sender::Outgoing;

/// Tuning for both directions of a transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Raw bytes per chunk.
    pub chunk_size: usize,
    /// Parallel lane connections per outgoing file.
    pub lanes: usize,
    /// Rounds of re-sending unacknowledged chunks before `FILE_END`.
    pub resend_rounds: u32,
    /// Completeness re-checks after `FILE_END` before finalizing anyway.
    pub end_retries: u32,
    pub end_retry_delay: Duration,
    /// How long the sender waits for outstanding ACKs per round.
    pub ack_settle: Duration,
    /// How long the sender waits for `FILE_HAVE` before starting at zero.
    pub query_timeout: Duration,
    pub partial_dir: PathBuf,
    pub attachment_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            lanes: DEFAULT_TRANSFER_LANES,
            resend_rounds: DEFAULT_RESEND_ROUNDS,
            end_retries: DEFAULT_END_RETRIES,
            end_retry_delay: Duration::from_millis(500),
            ack_settle: Duration::from_secs(3),
            query_timeout: Duration::from_secs(2),
            partial_dir: PathBuf::from("./data/partial"),
            attachment_dir: PathBuf::from("./data/attachments"),
        }
    }
}

/// Where an outgoing file goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferTarget {
    /// One user, by DM.
    Peer(String),
    /// Everyone in the sender's current room.
    Room,
}

impl TransferTarget {
    /// Wrap a frame into the chat command that carries it.
    fn wrap(&self, frame: &TransferFrame) -> String {
        match self {
            TransferTarget::Peer(peer) => Command::Dm {
                target: peer.clone(),
                text: frame.to_string(),
            }
            .to_string(),
            TransferTarget::Room => Command::Msg(frame.to_string()).to_string(),
        }
    }

    fn accepts_reply_from(&self, origin: &str) -> bool {
        match self {
            TransferTarget::Peer(peer) => peer == origin,
            TransferTarget::Room => true,
        }
    }

    fn label(&self) -> String {
        match self {
            TransferTarget::Peer(peer) => peer.clone(),
            TransferTarget::Room => "room".to_string(),
        }
    }
}

type OutgoingKey = (TransferTarget, String);

/// Held while a file streams to its destination. At most one file streams
/// to any receiver at a time; a room send excludes every peer send.
struct DestinationSlot {
    _shared: Option<OwnedRwLockReadGuard<()>>,
    _exclusive: Option<OwnedRwLockWriteGuard<()>>,
    _peer: Option<OwnedMutexGuard<()>>,
}

pub struct TransferCoordinator {
    identity: Identity,
    config: Arc<TransferConfig>,
    control: LineSender,
    index: Arc<Mutex<AttachmentIndex>>,
    outgoing: Mutex<HashMap<OutgoingKey, Arc<Outgoing>>>,
    room_slot: Arc<RwLock<()>>,
    peer_slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    receiver: Arc<Receiver>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferCoordinator {
    /// Build a coordinator on top of an established control connection.
    /// Scans the attachment directory before returning.
    pub async fn start(
        identity: Identity,
        control: LineSender,
        config: TransferConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>), TransferError> {
        let dir = config.attachment_dir.clone();
        let index = tokio::task::spawn_blocking(move || AttachmentIndex::open(&dir))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        let index = Arc::new(Mutex::new(index));

        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Receiver::new(config.clone(), index.clone(), events_tx.clone()));

        let coordinator = Arc::new(Self {
            identity,
            config,
            control,
            index,
            outgoing: Mutex::new(HashMap::new()),
            room_slot: Arc::new(RwLock::new(())),
            peer_slots: Mutex::new(HashMap::new()),
            receiver,
            events: events_tx,
        });
        Ok((coordinator, events_rx))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// A received or pre-existing attachment by content hash.
    pub fn attachment(&self, hash: &str) -> Option<AttachmentRecord> {
        self.index
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hash)
            .cloned()
    }

    /// Feed one line from the control connection. Returns `true` when the
    /// line was a transfer frame and has been consumed.
    pub async fn handle_line(&self, line: &ServerLine) -> bool {
        let (origin, text) = match line {
            ServerLine::DmFrom { from, text } | ServerLine::Group { from, text } => (from, text),
            _ => return false,
        };
        if !is_transfer_payload(text) {
            return false;
        }
        let frame = match TransferFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(origin = %origin, error = %e, "malformed transfer frame");
                return true;
            }
        };
        if let Err(e) = self.route(origin, frame).await {
            warn!(origin = %origin, error = %e, "transfer frame failed");
        }
        true
    }

    async fn route(&self, origin: &str, frame: TransferFrame) -> Result<(), TransferError> {
        match frame {
            TransferFrame::Meta {
                name, size, hash, ..
            } => {
                let have = self.receiver.on_meta(origin, &name, size, &hash).await?;
                self.reply(origin, &have).await
            }
            TransferFrame::Query { hash } => {
                let have = self.receiver.on_query(origin, &hash).await;
                self.reply(origin, &have).await
            }
            TransferFrame::Begin { name, size, .. } => {
                self.receiver.on_begin(origin, &name, size).await
            }
            TransferFrame::Chunk { offset, data } => {
                // Resolve the file before a later announcement from the same
                // origin can replace it.
                let Some(name) = self.receiver.streaming(origin) else {
                    debug!(origin = %origin, offset, "chunk without an announced file");
                    return Ok(());
                };
                let receiver = self.receiver.clone();
                let control = self.control.clone();
                let origin = origin.to_string();
                tokio::spawn(async move {
                    let ack = match receiver.write_chunk(&origin, &name, offset, &data).await {
                        Ok(Some(ack)) => ack,
                        Ok(None) => return,
                        Err(e) => {
                            warn!(origin = %origin, name = %name, error = %e, "chunk write failed");
                            return;
                        }
                    };
                    let line = TransferTarget::Peer(origin.clone()).wrap(&ack);
                    if let Err(e) = control.send_line(&line).await {
                        debug!(origin = %origin, error = %e, "could not acknowledge chunk");
                    }
                });
                Ok(())
            }
            TransferFrame::End { name } => {
                // Chunks may still be in flight on lane connections; the
                // re-check loop must not block the lines behind it.
                tokio::spawn(self.receiver.clone().on_end(origin.to_string(), name));
                Ok(())
            }
            TransferFrame::Cancel { name } => {
                self.receiver.on_cancel(origin, &name).await;
                Ok(())
            }
            TransferFrame::Ack { hash, offset, .. } => {
                if let Some(outgoing) = self.outgoing_for(origin, hash.as_deref()) {
                    outgoing.record_ack(offset);
                }
                Ok(())
            }
            TransferFrame::Have {
                hash,
                written,
                state,
            } => {
                if let Some(outgoing) = self.outgoing_for(origin, Some(&hash)) {
                    outgoing.record_have(state, written);
                }
                Ok(())
            }
        }
    }

    async fn reply(&self, origin: &str, frame: &TransferFrame) -> Result<(), TransferError> {
        let line = TransferTarget::Peer(origin.to_string()).wrap(frame);
        self.control.send_line(&line).await
    }

    /// The outgoing transfer a reply belongs to. Replies without a hash go
    /// to the single transfer headed for that peer, if there is exactly one.
    fn outgoing_for(&self, origin: &str, hash: Option<&str>) -> Option<Arc<Outgoing>> {
        let outgoing = self.outgoing.lock().unwrap_or_else(|p| p.into_inner());
        let mut candidates = outgoing
            .values()
            .filter(|o| o.target.accepts_reply_from(origin))
            .filter(|o| hash.map_or(true, |h| o.hash == h));
        let first = candidates.next().cloned();
        if hash.is_none() && candidates.next().is_some() {
            return None;
        }
        first
    }

    fn register(&self, outgoing: Arc<Outgoing>) {
        let key = (outgoing.target.clone(), outgoing.name.clone());
        self.outgoing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, outgoing);
    }

    fn unregister(&self, outgoing: &Arc<Outgoing>) {
        let key = (outgoing.target.clone(), outgoing.name.clone());
        let mut map = self.outgoing.lock().unwrap_or_else(|p| p.into_inner());
        if map
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, outgoing))
        {
            map.remove(&key);
        }
    }

    /// Wait until `target` is free to receive a new file.
    async fn reserve(&self, target: &TransferTarget) -> DestinationSlot {
        match target {
            TransferTarget::Room => DestinationSlot {
                _shared: None,
                _exclusive: Some(self.room_slot.clone().write_owned().await),
                _peer: None,
            },
            TransferTarget::Peer(peer) => {
                let shared = self.room_slot.clone().read_owned().await;
                let slot = self
                    .peer_slots
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .entry(peer.clone())
                    .or_default()
                    .clone();
                DestinationSlot {
                    _shared: Some(shared),
                    _exclusive: None,
                    _peer: Some(slot.lock_owned().await),
                }
            }
        }
    }

    /// Send a file and wait until it is finished, deduplicated or canceled.
    pub async fn send_file(
        &self,
        target: TransferTarget,
        path: &Path,
    ) -> Result<SendOutcome, TransferError> {
        sender::send_file(self, target, path).await
    }

    fn lookup(&self, target: &TransferTarget, name: &str) -> Option<Arc<Outgoing>> {
        self.outgoing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(target.clone(), name.to_string()))
            .cloned()
    }

    /// Phase of a running outgoing transfer.
    pub fn phase(&self, target: &TransferTarget, name: &str) -> Option<SenderPhase> {
        self.lookup(target, name).map(|outgoing| outgoing.phase())
    }

    /// Cooperatively cancel the outgoing transfer of `name` to `target`.
    /// Returns `false` if no such transfer is running.
    pub fn cancel(&self, target: &TransferTarget, name: &str) -> bool {
        let outgoing = self.lookup(target, name);
        match outgoing {
            Some(outgoing) => {
                outgoing.cancel();
                true
            }
            None => false,
        }
    }
}
