//! Sending side: announce, learn the resume point, pump chunks over the
//! lanes, re-send what was not acknowledged, then `FILE_END`.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::try_join_all;
use lanchat_shared::transfer::{sanitize_name, HaveState, TransferFrame};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{TransferCoordinator, TransferTarget};
use crate::attachments::hash_file;
use crate::connection::{connect, LineSender};
use crate::error::TransferError;
use crate::events::{SendOutcome, SenderPhase, TransferEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Shared state of one outgoing file. Replies routed by the coordinator
/// land here and wake the sending task.
pub(super) struct Outgoing {
    pub(super) target: TransferTarget,
    pub(super) name: String,
    pub(super) hash: String,
    phase: Mutex<SenderPhase>,
    have: Mutex<Option<(HaveState, u64)>>,
    acked: Mutex<HashSet<u64>>,
    canceled: AtomicBool,
    signal: Notify,
}

impl Outgoing {
    fn new(target: TransferTarget, name: String, hash: String) -> Self {
        Self {
            target,
            name,
            hash,
            phase: Mutex::new(SenderPhase::Idle),
            have: Mutex::new(None),
            acked: Mutex::new(HashSet::new()),
            canceled: AtomicBool::new(false),
            signal: Notify::new(),
        }
    }

    pub(super) fn phase(&self) -> SenderPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: SenderPhase) {
        debug!(name = %self.name, ?phase, "sender phase");
        *lock(&self.phase) = phase;
    }

    pub(super) fn record_ack(&self, offset: u64) {
        lock(&self.acked).insert(offset);
        self.signal.notify_waiters();
    }

    pub(super) fn record_have(&self, state: HaveState, written: u64) {
        *lock(&self.have) = Some((state, written));
        self.signal.notify_waiters();
    }

    pub(super) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.signal.notify_waiters();
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn have(&self) -> Option<(HaveState, u64)> {
        *lock(&self.have)
    }

    /// Offsets from `sent` with no ACK yet, in ascending order.
    fn missing(&self, sent: &[u64]) -> Vec<u64> {
        let acked = lock(&self.acked);
        sent.iter().copied().filter(|o| !acked.contains(o)).collect()
    }

    /// Wait until `ready` holds, cancellation is requested, or `timeout`
    /// passes. Returns the final value of `ready`.
    async fn wait_until(&self, timeout: Duration, ready: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(self) {
                return true;
            }
            if self.is_canceled() {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return ready(self);
            }
        }
    }
}

/// MIME type from the file extension. Receivers only use it for display.
fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Chunk start offsets from `resume` to the end of the file.
fn chunk_offsets(resume: u64, size: u64, chunk_size: u64) -> Vec<u64> {
    (resume..size).step_by(chunk_size as usize).collect()
}

/// Round a receiver's written count down to a chunk boundary.
fn resume_point(written: u64, size: u64, chunk_size: u64) -> u64 {
    written.min(size) / chunk_size * chunk_size
}

struct Lane {
    sender: LineSender,
    drain: JoinHandle<()>,
}

/// Open up to `count` lane connections. Fewer come back if the server
/// refuses some; the caller falls back to the control connection.
async fn open_lanes(coord: &TransferCoordinator, count: usize) -> Vec<Lane> {
    let mut lanes = Vec::with_capacity(count);
    for n in 0..count {
        match connect(&coord.identity, true).await {
            Ok(conn) => {
                let mut reader = conn.reader;
                // Lanes never get chat traffic, but the socket must be read.
                let drain = tokio::spawn(async move {
                    while let Ok(Some(_)) = reader.next_raw().await {}
                });
                lanes.push(Lane {
                    sender: conn.sender,
                    drain,
                });
            }
            Err(e) => {
                warn!(lane = n, error = %e, "could not open transfer lane");
                break;
            }
        }
    }
    lanes
}

async fn close_lanes(lanes: Vec<Lane>) {
    for lane in lanes {
        lane.sender.shutdown().await;
        lane.drain.abort();
    }
}

/// Send `offsets` over one connection. A failed write ends this lane; the
/// chunks it did not deliver are picked up by the re-send rounds.
async fn pump_lane(
    outgoing: &Outgoing,
    path: &Path,
    size: u64,
    chunk_size: u64,
    sender: &LineSender,
    offsets: Vec<u64>,
) -> Result<usize, TransferError> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; chunk_size as usize];
    let mut sent = 0;
    for offset in offsets {
        if outgoing.is_canceled() {
            break;
        }
        let len = chunk_size.min(size - offset) as usize;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf[..len]).await?;
        let line = outgoing.target.wrap(&TransferFrame::chunk(offset, &buf[..len]));
        if let Err(e) = sender.send_line(&line).await {
            warn!(name = %outgoing.name, offset, error = %e, "lane write failed");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

/// Spread `offsets` round-robin over `senders` and send them in parallel.
async fn pump(
    outgoing: &Outgoing,
    path: &Path,
    size: u64,
    chunk_size: u64,
    senders: &[LineSender],
    offsets: &[u64],
) -> Result<usize, TransferError> {
    let width = senders.len().max(1);
    let jobs = senders.iter().enumerate().map(|(i, sender)| {
        let mine: Vec<u64> = offsets.iter().copied().skip(i).step_by(width).collect();
        pump_lane(outgoing, path, size, chunk_size, sender, mine)
    });
    Ok(try_join_all(jobs).await?.into_iter().sum())
}

pub(super) async fn send_file(
    coord: &TransferCoordinator,
    target: TransferTarget,
    path: &Path,
) -> Result<SendOutcome, TransferError> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(TransferError::NotAFile(path.to_path_buf()));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(sanitize_name)
        .ok_or_else(|| TransferError::NotAFile(path.to_path_buf()))?;

    let hashed = path.to_path_buf();
    let (hash, size) = tokio::task::spawn_blocking(move || hash_file(&hashed))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

    let _slot = coord.reserve(&target).await;
    let outgoing = Arc::new(Outgoing::new(target, name, hash));
    coord.register(outgoing.clone());
    let result = run(coord, &outgoing, path, size).await;
    coord.unregister(&outgoing);

    match &result {
        Ok(outcome) => {
            let _ = coord.events.send(TransferEvent::SenderFinished {
                target: outgoing.target.label(),
                outcome: outcome.clone(),
            });
        }
        Err(e) => debug!(name = %outgoing.name, error = %e, "outgoing transfer ended early"),
    }
    result
}

async fn run(
    coord: &TransferCoordinator,
    outgoing: &Arc<Outgoing>,
    path: &Path,
    size: u64,
) -> Result<SendOutcome, TransferError> {
    let config = coord.config.clone();
    let chunk_size = config.chunk_size.max(1) as u64;
    let control = &coord.control;
    let target = &outgoing.target;
    let name = outgoing.name.clone();
    let mime = guess_mime(&name).to_string();

    let mut outcome = SendOutcome {
        name: name.clone(),
        hash: outgoing.hash.clone(),
        size,
        resumed_from: 0,
        chunks_sent: 0,
        chunks_resent: 0,
        unacked: Vec::new(),
        deduplicated: false,
    };

    outgoing.set_phase(SenderPhase::Querying);
    control
        .send_line(&target.wrap(&TransferFrame::Meta {
            name: name.clone(),
            mime: mime.clone(),
            size,
            hash: outgoing.hash.clone(),
        }))
        .await?;
    control
        .send_line(&target.wrap(&TransferFrame::Query {
            hash: outgoing.hash.clone(),
        }))
        .await?;
    control
        .send_line(&target.wrap(&TransferFrame::Begin {
            name: name.clone(),
            mime,
            size,
        }))
        .await?;
    outgoing.set_phase(SenderPhase::BeginSent);

    // A room has many receivers; their hints cannot be merged, so room
    // transfers always start from zero.
    if matches!(target, TransferTarget::Peer(_)) {
        outgoing
            .wait_until(config.query_timeout, |o| o.have().is_some())
            .await;
        match outgoing.have() {
            Some((HaveState::Complete, _)) => {
                info!(name = %name, hash = %outgoing.hash, "receiver already has this file");
                outgoing.set_phase(SenderPhase::Complete);
                outcome.deduplicated = true;
                outcome.resumed_from = size;
                return Ok(outcome);
            }
            Some((HaveState::Partial, written)) => {
                outcome.resumed_from = resume_point(written, size, chunk_size);
            }
            None => debug!(name = %name, "no FILE_HAVE before timeout, starting at zero"),
        }
    }
    if outgoing.is_canceled() {
        return abort(control, outgoing, Vec::new()).await;
    }

    let offsets = chunk_offsets(outcome.resumed_from, size, chunk_size);
    let lanes = open_lanes(coord, config.lanes.min(offsets.len())).await;
    let senders: Vec<LineSender> = if lanes.is_empty() {
        vec![control.clone()]
    } else {
        lanes.iter().map(|lane| lane.sender.clone()).collect()
    };
    info!(
        name = %name,
        size,
        from = outcome.resumed_from,
        chunks = offsets.len(),
        lanes = senders.len(),
        "sending file"
    );

    outgoing.set_phase(SenderPhase::Transferring);
    outcome.chunks_sent = match pump(outgoing, path, size, chunk_size, &senders, &offsets).await {
        Ok(sent) => sent,
        Err(e) => {
            close_lanes(lanes).await;
            return Err(e);
        }
    };

    let mut round = 0;
    loop {
        outgoing
            .wait_until(config.ack_settle, |o| o.missing(&offsets).is_empty())
            .await;
        if outgoing.is_canceled() {
            break;
        }
        let missing = outgoing.missing(&offsets);
        if missing.is_empty() || round >= config.resend_rounds {
            outcome.unacked = missing;
            break;
        }
        round += 1;
        outgoing.set_phase(SenderPhase::Resending(round));
        debug!(name = %name, round, missing = missing.len(), "re-sending unacknowledged chunks");
        match pump(outgoing, path, size, chunk_size, &senders, &missing).await {
            Ok(sent) => outcome.chunks_resent += sent,
            Err(e) => {
                close_lanes(lanes).await;
                return Err(e);
            }
        }
    }

    if outgoing.is_canceled() {
        return abort(control, outgoing, lanes).await;
    }

    control
        .send_line(&target.wrap(&TransferFrame::End { name: name.clone() }))
        .await?;
    close_lanes(lanes).await;
    if !outcome.unacked.is_empty() {
        warn!(name = %name, unacked = outcome.unacked.len(), "FILE_END sent with unacknowledged chunks");
    }
    outgoing.set_phase(SenderPhase::Complete);
    info!(name = %name, sent = outcome.chunks_sent, resent = outcome.chunks_resent, "file sent");
    Ok(outcome)
}

async fn abort(
    control: &LineSender,
    outgoing: &Outgoing,
    lanes: Vec<Lane>,
) -> Result<SendOutcome, TransferError> {
    close_lanes(lanes).await;
    let cancel = TransferFrame::Cancel {
        name: outgoing.name.clone(),
    };
    if let Err(e) = control.send_line(&outgoing.target.wrap(&cancel)).await {
        warn!(name = %outgoing.name, error = %e, "could not announce cancellation");
    }
    outgoing.set_phase(SenderPhase::Canceled);
    info!(name = %outgoing.name, "transfer canceled");
    Err(TransferError::Canceled(outgoing.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_offsets_and_resume_point() {
        assert_eq!(chunk_offsets(0, 10, 4), vec![0, 4, 8]);
        assert_eq!(chunk_offsets(8, 10, 4), vec![8]);
        assert!(chunk_offsets(0, 0, 4).is_empty());

        assert_eq!(resume_point(7, 10, 4), 4);
        assert_eq!(resume_point(8, 10, 4), 8);
        assert_eq!(resume_point(99, 10, 4), 8);
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("a.PDF"), "application/pdf");
        assert_eq!(guess_mime("photo.jpeg"), "image/jpeg");
        assert_eq!(guess_mime("README"), "application/octet-stream");
    }

    #[test]
    fn test_missing_tracks_acks() {
        let outgoing = Outgoing::new(TransferTarget::Room, "f".into(), "h".into());
        outgoing.record_ack(4);
        outgoing.record_ack(4);
        assert_eq!(outgoing.missing(&[0, 4, 8]), vec![0, 8]);
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_have() {
        let outgoing = Arc::new(Outgoing::new(
            TransferTarget::Peer("bob".into()),
            "f".into(),
            "h".into(),
        ));
        let waiter = outgoing.clone();
        let task = tokio::spawn(async move {
            waiter
                .wait_until(Duration::from_secs(5), |o| o.have().is_some())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        outgoing.record_have(HaveState::Partial, 3);
        assert!(task.await.unwrap());
        assert_eq!(outgoing.have(), Some((HaveState::Partial, 3)));
    }

    #[tokio::test]
    async fn test_wait_until_times_out_and_cancel_wakes() {
        let outgoing = Outgoing::new(TransferTarget::Room, "f".into(), "h".into());
        assert!(
            !outgoing
                .wait_until(Duration::from_millis(20), |o| o.have().is_some())
                .await
        );

        outgoing.cancel();
        assert!(
            !outgoing
                .wait_until(Duration::from_secs(5), |o| o.have().is_some())
                .await
        );
        assert!(outgoing.is_canceled());
    }
}
