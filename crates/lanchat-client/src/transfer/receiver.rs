//! Receiving side of the coordinator: one sink per (origin, file name).

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use lanchat_shared::transfer::{decode_chunk, decoded_len, sanitize_name, HaveState, TransferFrame};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::TransferConfig;
use crate::attachments::{hash_file, AttachmentIndex, AttachmentRecord};
use crate::error::TransferError;
use crate::events::TransferEvent;

type TransferKey = (String, String);

struct Incoming {
    origin: String,
    name: String,
    size: Option<u64>,
    hash: Option<String>,
    partial: PathBuf,
    file: Option<File>,
    /// Written ranges, offset -> length. Duplicates overwrite the same bytes.
    received: BTreeMap<u64, u64>,
    done: bool,
}

impl Incoming {
    fn new(origin: &str, name: &str, partial_dir: &Path) -> Self {
        Self {
            origin: origin.to_string(),
            name: name.to_string(),
            size: None,
            hash: None,
            partial: partial_dir.join(format!("{}__{}.part", sanitize_name(origin), name)),
            file: None,
            received: BTreeMap::new(),
            done: false,
        }
    }

    /// Length of the gap-free prefix written so far.
    fn contiguous(&self) -> u64 {
        let mut end = 0;
        for (offset, len) in &self.received {
            if *offset > end {
                break;
            }
            end = end.max(offset + len);
        }
        end
    }

    fn is_complete(&self) -> bool {
        self.size.is_some_and(|size| self.contiguous() >= size)
    }

    /// Open the partial file without truncating it. When resuming against a
    /// known hash, bytes already on disk count as received.
    async fn open_sink(&mut self, partial_dir: &Path) -> Result<(), TransferError> {
        if self.file.is_some() {
            return Ok(());
        }
        fs::create_dir_all(partial_dir).await?;
        let resume = self.hash.is_some();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!resume)
            .open(&self.partial)
            .await?;
        if resume && self.received.is_empty() {
            self.seed_from_disk().await;
        }
        self.file = Some(file);
        Ok(())
    }

    async fn seed_from_disk(&mut self) {
        if let Ok(meta) = fs::metadata(&self.partial).await {
            let len = match self.size {
                Some(size) => meta.len().min(size),
                None => meta.len(),
            };
            if len > 0 {
                self.received.insert(0, len);
            }
        }
    }
}

pub(crate) struct Receiver {
    config: Arc<TransferConfig>,
    index: Arc<Mutex<AttachmentIndex>>,
    transfers: Mutex<HashMap<TransferKey, Arc<AsyncMutex<Incoming>>>>,
    /// Name of the transfer each origin is currently streaming; chunks carry
    /// only an offset.
    current: Mutex<HashMap<String, String>>,
    /// File each origin last announced that we already held; its `FILE_BEGIN`
    /// is answered by nothing.
    settled: Mutex<HashMap<String, String>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Receiver {
    pub(crate) fn new(
        config: Arc<TransferConfig>,
        index: Arc<Mutex<AttachmentIndex>>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            config,
            index,
            transfers: Mutex::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lookup(&self, origin: &str, name: &str) -> Option<Arc<AsyncMutex<Incoming>>> {
        lock(&self.transfers)
            .get(&(origin.to_string(), name.to_string()))
            .cloned()
    }

    fn entry(&self, origin: &str, name: &str) -> Arc<AsyncMutex<Incoming>> {
        lock(&self.current).insert(origin.to_string(), name.to_string());
        lock(&self.transfers)
            .entry((origin.to_string(), name.to_string()))
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Incoming::new(
                    origin,
                    name,
                    &self.config.partial_dir,
                )))
            })
            .clone()
    }

    fn forget(&self, origin: &str, name: &str) {
        lock(&self.transfers).remove(&(origin.to_string(), name.to_string()));
        let mut current = lock(&self.current);
        if current.get(origin).map(String::as_str) == Some(name) {
            current.remove(origin);
        }
    }

    fn complete_copy(&self, hash: &str) -> Option<AttachmentRecord> {
        lock(&self.index).get(hash).cloned()
    }

    /// `FILE_META`: remember what is coming and report what we hold.
    pub(crate) async fn on_meta(
        &self,
        origin: &str,
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<TransferFrame, TransferError> {
        let name = sanitize_name(name);
        lock(&self.settled).remove(origin);
        let entry = self.entry(origin, &name);
        let mut incoming = entry.lock().await;

        if incoming.hash.as_deref() != Some(hash) || incoming.done {
            *incoming = Incoming::new(origin, &name, &self.config.partial_dir);
        }
        incoming.hash = Some(hash.to_string());
        incoming.size = Some(size);

        if let Some(existing) = self.complete_copy(hash) {
            incoming.done = true;
            drop(incoming);
            self.forget(origin, &name);
            lock(&self.settled).insert(origin.to_string(), name.clone());
            info!(origin = %origin, name = %name, "already have this file, skipping transfer");
            let _ = self.events.send(TransferEvent::Delivered {
                origin: origin.to_string(),
                name: name.clone(),
                path: existing.path.clone(),
                size: existing.size,
                hash: existing.hash.clone(),
                complete: true,
            });
            return Ok(TransferFrame::Have {
                hash: hash.to_string(),
                written: existing.size,
                state: HaveState::Complete,
            });
        }

        if incoming.received.is_empty() {
            incoming.seed_from_disk().await;
        }
        Ok(TransferFrame::Have {
            hash: hash.to_string(),
            written: incoming.contiguous(),
            state: HaveState::Partial,
        })
    }

    /// `FILE_QUERY`: same answer as for META, keyed by hash only.
    pub(crate) async fn on_query(&self, origin: &str, hash: &str) -> TransferFrame {
        if let Some(existing) = self.complete_copy(hash) {
            return TransferFrame::Have {
                hash: hash.to_string(),
                written: existing.size,
                state: HaveState::Complete,
            };
        }

        let name = lock(&self.current).get(origin).cloned();
        let mut written = 0;
        if let Some(entry) = name.and_then(|n| self.lookup(origin, &n)) {
            let incoming = entry.lock().await;
            if incoming.hash.as_deref() == Some(hash) {
                written = incoming.contiguous();
            }
        }
        TransferFrame::Have {
            hash: hash.to_string(),
            written,
            state: HaveState::Partial,
        }
    }

    /// `FILE_BEGIN`: open the sink unless the file is already here.
    pub(crate) async fn on_begin(
        &self,
        origin: &str,
        name: &str,
        size: u64,
    ) -> Result<(), TransferError> {
        let name = sanitize_name(name);
        {
            let mut settled = lock(&self.settled);
            if settled.get(origin) == Some(&name) {
                settled.remove(origin);
                debug!(origin = %origin, name = %name, "ignoring FILE_BEGIN for a file already held");
                return Ok(());
            }
        }
        let entry = self.entry(origin, &name);
        let mut incoming = entry.lock().await;
        if incoming.done {
            debug!(origin = %origin, name = %name, "ignoring FILE_BEGIN for settled transfer");
            return Ok(());
        }
        incoming.size = Some(size);
        incoming.open_sink(&self.config.partial_dir).await?;
        debug!(origin = %origin, name = %name, size, "receiving file");

        if incoming.is_complete() {
            self.finalize(&mut incoming, true).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn on_chunk(
        &self,
        origin: &str,
        offset: u64,
        data: &str,
    ) -> Result<Option<TransferFrame>, TransferError> {
        match self.streaming(origin) {
            Some(name) => self.write_chunk(origin, &name, offset, data).await,
            None => Ok(None),
        }
    }

    /// The file `origin` is currently streaming; chunks carry only an offset.
    pub(crate) fn streaming(&self, origin: &str) -> Option<String> {
        lock(&self.current).get(origin).cloned()
    }

    /// `FILE_CHUNK`: write at the offset and acknowledge.
    pub(crate) async fn write_chunk(
        &self,
        origin: &str,
        name: &str,
        offset: u64,
        data: &str,
    ) -> Result<Option<TransferFrame>, TransferError> {
        let Some(entry) = self.lookup(origin, name) else {
            return Ok(None);
        };
        let mut incoming = entry.lock().await;
        if incoming.done {
            return Ok(None);
        }

        let len = decoded_len(data) as u64;
        if let Some(size) = incoming.size {
            if offset.checked_add(len).map_or(true, |end| end > size) {
                warn!(origin = %origin, name = %name, offset, len, size, "chunk past end of file");
                return Ok(None);
            }
        }
        let bytes = decode_chunk(data)?;
        if bytes.len() as u64 != len {
            warn!(origin = %origin, name = %name, offset, "chunk length does not match its encoding");
            return Ok(None);
        }

        incoming.open_sink(&self.config.partial_dir).await?;
        if let Some(file) = incoming.file.as_mut() {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&bytes).await?;
        }
        let known = incoming.received.entry(offset).or_insert(0);
        *known = (*known).max(len);

        let ack = TransferFrame::Ack {
            hash: incoming.hash.clone(),
            offset,
            written: len,
        };
        if incoming.is_complete() {
            self.finalize(&mut incoming, true).await?;
        }
        Ok(Some(ack))
    }

    /// `FILE_END`: finalize once complete, re-checking a few times for
    /// chunks still in flight on other connections.
    pub(crate) async fn on_end(self: Arc<Self>, origin: String, name: String) {
        let name = sanitize_name(&name);
        let retries = self.config.end_retries;
        for attempt in 0..=retries {
            let Some(entry) = self.lookup(&origin, &name) else {
                return;
            };
            {
                let mut incoming = entry.lock().await;
                if incoming.done {
                    return;
                }
                let complete = incoming.is_complete();
                if complete || attempt == retries {
                    if !complete {
                        warn!(
                            origin = %origin,
                            name = %name,
                            have = incoming.contiguous(),
                            size = ?incoming.size,
                            "file incomplete after FILE_END, keeping what arrived"
                        );
                    }
                    if let Err(e) = self.finalize(&mut incoming, complete).await {
                        warn!(origin = %origin, name = %name, error = %e, "finalize failed");
                    }
                    return;
                }
            }
            tokio::time::sleep(self.config.end_retry_delay).await;
        }
    }

    /// `FILE_CANCEL`: drop the sink and its partial file.
    pub(crate) async fn on_cancel(&self, origin: &str, name: &str) {
        let name = sanitize_name(name);
        let Some(entry) = self.lookup(origin, &name) else {
            return;
        };
        let mut incoming = entry.lock().await;
        incoming.done = true;
        incoming.file = None;
        if let Err(e) = fs::remove_file(&incoming.partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %incoming.partial.display(), error = %e, "could not remove partial file");
            }
        }
        self.forget(origin, &name);
        info!(origin = %origin, name = %name, "transfer canceled by sender");
        let _ = self.events.send(TransferEvent::Canceled {
            origin: origin.to_string(),
            name,
        });
    }

    /// Move the partial file into the attachment directory and index it.
    async fn finalize(&self, incoming: &mut Incoming, complete: bool) -> Result<(), TransferError> {
        incoming.done = true;
        if let Some(mut file) = incoming.file.take() {
            file.flush().await?;
        } else if !fs::try_exists(&incoming.partial).await.unwrap_or(false) {
            fs::create_dir_all(&self.config.partial_dir).await?;
            File::create(&incoming.partial).await?;
        }

        let target = {
            let index = lock(&self.index);
            index.free_path(&incoming.name)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::rename(&incoming.partial, &target).await.is_err() {
            fs::copy(&incoming.partial, &target).await?;
            fs::remove_file(&incoming.partial).await?;
        }

        let hashed = target.clone();
        let (hash, size) = tokio::task::spawn_blocking(move || hash_file(&hashed))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        let verified = incoming.hash.as_deref().map_or(true, |h| h == hash);
        if !verified {
            warn!(name = %incoming.name, expected = ?incoming.hash, actual = %hash, "content hash mismatch");
        }

        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&incoming.name)
            .to_string();
        lock(&self.index).insert(AttachmentRecord {
            hash: hash.clone(),
            name,
            path: target.clone(),
            size,
        });
        self.forget(&incoming.origin, &incoming.name);

        info!(origin = %incoming.origin, name = %incoming.name, size, path = %target.display(), "file received");
        let _ = self.events.send(TransferEvent::Delivered {
            origin: incoming.origin.clone(),
            name: incoming.name.clone(),
            path: target,
            size,
            hash,
            complete: complete && verified,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        receiver: Arc<Receiver>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = TransferConfig {
            partial_dir: dir.path().join("partial"),
            attachment_dir: dir.path().join("files"),
            end_retries: 2,
            end_retry_delay: Duration::from_millis(10),
            ..TransferConfig::default()
        };
        let index = AttachmentIndex::open(&config.attachment_dir).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Receiver::new(
            Arc::new(config),
            Arc::new(Mutex::new(index)),
            tx,
        ));
        Fixture {
            receiver,
            events: rx,
            dir,
        }
    }

    fn b64(bytes: &[u8]) -> String {
        match TransferFrame::chunk(0, bytes) {
            TransferFrame::Chunk { data, .. } => data,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn hash_of(bytes: &[u8]) -> String {
        blake3::hash(bytes).to_hex().to_string()
    }

    #[tokio::test]
    async fn test_out_of_order_and_duplicate_chunks() {
        let mut f = fixture();
        let body = b"0123456789abcdef";
        let hash = hash_of(body);

        let have = f.receiver.on_meta("alice", "data.bin", 16, &hash).await.unwrap();
        assert_eq!(
            have,
            TransferFrame::Have {
                hash: hash.clone(),
                written: 0,
                state: HaveState::Partial
            }
        );
        f.receiver.on_begin("alice", "data.bin", 16).await.unwrap();

        let ack = f.receiver.on_chunk("alice", 8, &b64(&body[8..12])).await.unwrap();
        assert_eq!(
            ack,
            Some(TransferFrame::Ack {
                hash: Some(hash.clone()),
                offset: 8,
                written: 4
            })
        );
        f.receiver.on_chunk("alice", 0, &b64(&body[0..4])).await.unwrap();
        f.receiver.on_chunk("alice", 0, &b64(&body[0..4])).await.unwrap();
        f.receiver.on_chunk("alice", 12, &b64(&body[12..16])).await.unwrap();
        assert!(f.events.try_recv().is_err());

        f.receiver.on_chunk("alice", 4, &b64(&body[4..8])).await.unwrap();
        match f.events.try_recv().unwrap() {
            TransferEvent::Delivered {
                path,
                size,
                complete,
                hash: got,
                ..
            } => {
                assert!(complete);
                assert_eq!(size, 16);
                assert_eq!(got, hash);
                assert_eq!(std::fs::read(path).unwrap(), body);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Late duplicate after completion is ignored.
        let late = f.receiver.on_chunk("alice", 4, &b64(&body[4..8])).await.unwrap();
        assert_eq!(late, None);
        assert!(f.events.try_recv().is_err());
        assert!(!f.dir.path().join("partial/alice__data.bin.part").exists());
    }

    #[tokio::test]
    async fn test_known_file_short_circuits() {
        let mut f = fixture();
        std::fs::write(f.dir.path().join("files/report.pdf"), b"pdf-bytes").unwrap();
        let hash = hash_of(b"pdf-bytes");
        {
            let mut index = f.receiver.index.lock().unwrap();
            let (h, size) = hash_file(&f.dir.path().join("files/report.pdf")).unwrap();
            index.insert(AttachmentRecord {
                hash: h,
                name: "report.pdf".into(),
                path: f.dir.path().join("files/report.pdf"),
                size,
            });
        }

        let have = f.receiver.on_meta("bob", "report.pdf", 9, &hash).await.unwrap();
        assert!(matches!(
            have,
            TransferFrame::Have {
                state: HaveState::Complete,
                written: 9,
                ..
            }
        ));
        assert!(matches!(
            f.events.try_recv().unwrap(),
            TransferEvent::Delivered { complete: true, .. }
        ));

        f.receiver.on_begin("bob", "report.pdf", 9).await.unwrap();
        assert_eq!(f.receiver.on_chunk("bob", 0, &b64(b"pdf")).await.unwrap(), None);
        assert!(!f.dir.path().join("partial/bob__report.pdf.part").exists());
        assert!(lock(&f.receiver.transfers).is_empty());
        assert!(lock(&f.receiver.current).is_empty());
        assert!(lock(&f.receiver.settled).is_empty());

        let query = f.receiver.on_query("bob", &hash).await;
        assert!(matches!(
            query,
            TransferFrame::Have {
                state: HaveState::Complete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_removes_partial() {
        let mut f = fixture();
        let hash = hash_of(b"abcdefgh");
        f.receiver.on_meta("carol", "x.bin", 8, &hash).await.unwrap();
        f.receiver.on_begin("carol", "x.bin", 8).await.unwrap();
        f.receiver.on_chunk("carol", 0, &b64(b"abcd")).await.unwrap();
        let partial = f.dir.path().join("partial/carol__x.bin.part");
        assert!(partial.exists());

        f.receiver.on_cancel("carol", "x.bin").await;
        assert!(!partial.exists());
        assert!(matches!(
            f.events.try_recv().unwrap(),
            TransferEvent::Canceled { .. }
        ));
        assert_eq!(f.receiver.on_chunk("carol", 4, &b64(b"efgh")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_with_gap_finalizes_incomplete() {
        let mut f = fixture();
        let hash = hash_of(b"abcdefgh");
        f.receiver.on_meta("dave", "gap.bin", 8, &hash).await.unwrap();
        f.receiver.on_begin("dave", "gap.bin", 8).await.unwrap();
        f.receiver.on_chunk("dave", 4, &b64(b"efgh")).await.unwrap();

        f.receiver
            .clone()
            .on_end("dave".into(), "gap.bin".into())
            .await;
        match f.events.try_recv().unwrap() {
            TransferEvent::Delivered { complete, path, .. } => {
                assert!(!complete);
                assert!(path.exists());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_hint_from_partial_on_disk() {
        let f = fixture();
        std::fs::create_dir_all(f.dir.path().join("partial")).unwrap();
        std::fs::write(f.dir.path().join("partial/erin__big.bin.part"), b"0123").unwrap();
        let hash = hash_of(b"01234567");

        let have = f.receiver.on_meta("erin", "big.bin", 8, &hash).await.unwrap();
        assert_eq!(
            have,
            TransferFrame::Have {
                hash: hash.clone(),
                written: 4,
                state: HaveState::Partial
            }
        );
        assert_eq!(
            f.receiver.on_query("erin", &hash).await,
            TransferFrame::Have {
                hash,
                written: 4,
                state: HaveState::Partial
            }
        );
    }

    #[tokio::test]
    async fn test_empty_file_completes_on_begin() {
        let mut f = fixture();
        f.receiver.on_meta("fay", "empty.txt", 0, &hash_of(b"")).await.unwrap();
        f.receiver.on_begin("fay", "empty.txt", 0).await.unwrap();
        match f.events.try_recv().unwrap() {
            TransferEvent::Delivered { size, complete, .. } => {
                assert_eq!(size, 0);
                assert!(complete);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeated_known_files_leave_no_state() {
        let f = fixture();
        let body = b"already here";
        std::fs::write(f.dir.path().join("files/known.txt"), body).unwrap();
        {
            let mut index = f.receiver.index.lock().unwrap();
            let (hash, size) = hash_file(&f.dir.path().join("files/known.txt")).unwrap();
            index.insert(AttachmentRecord {
                hash,
                name: "known.txt".into(),
                path: f.dir.path().join("files/known.txt"),
                size,
            });
        }
        let hash = hash_of(body);
        for origin in ["ann", "ben", "cat", "dan"] {
            for _ in 0..3 {
                f.receiver.on_meta(origin, "known.txt", 12, &hash).await.unwrap();
            }
        }
        assert!(lock(&f.receiver.transfers).is_empty());
        assert!(lock(&f.receiver.current).is_empty());
        assert_eq!(lock(&f.receiver.settled).len(), 4);

        // A fresh file from the same origin is received normally afterwards.
        let fresh = b"new";
        f.receiver.on_meta("ann", "fresh.txt", 3, &hash_of(fresh)).await.unwrap();
        f.receiver.on_begin("ann", "fresh.txt", 3).await.unwrap();
        assert!(f.receiver.on_chunk("ann", 0, &b64(fresh)).await.unwrap().is_some());
        assert!(lock(&f.receiver.transfers).is_empty());
    }

    #[tokio::test]
    async fn test_chunk_offset_near_u64_max_is_rejected() {
        let f = fixture();
        let hash = hash_of(b"0123456789abcdef");
        f.receiver.on_meta("gus", "wrap.bin", 16, &hash).await.unwrap();
        f.receiver.on_begin("gus", "wrap.bin", 16).await.unwrap();

        assert_eq!(f.receiver.on_chunk("gus", u64::MAX, "QUJD").await.unwrap(), None);
        assert_eq!(f.receiver.on_chunk("gus", u64::MAX - 1, "QUJD").await.unwrap(), None);
        assert_eq!(f.receiver.on_chunk("gus", 14, "QUJD").await.unwrap(), None);
        // The transfer is still usable.
        assert!(f.receiver.on_chunk("gus", 13, "QUJD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shuffled_chunks_with_duplicates_reassemble() {
        let mut f = fixture();
        let chunk = 64usize;
        let body: Vec<u8> = (0..chunk * 40 + 17).map(|i| (i * 7 % 256) as u8).collect();
        let hash = hash_of(&body);
        f.receiver
            .on_meta("hal", "shuffle.bin", body.len() as u64, &hash)
            .await
            .unwrap();
        f.receiver
            .on_begin("hal", "shuffle.bin", body.len() as u64)
            .await
            .unwrap();

        let mut offsets: Vec<usize> = (0..body.len()).step_by(chunk).collect();
        // Every third chunk arrives twice.
        let dupes: Vec<usize> = offsets.iter().copied().step_by(3).collect();
        offsets.extend(dupes);
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for i in (1..offsets.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            offsets.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for offset in offsets {
            let end = (offset + chunk).min(body.len());
            f.receiver
                .on_chunk("hal", offset as u64, &b64(&body[offset..end]))
                .await
                .unwrap();
        }
        match f.events.try_recv().unwrap() {
            TransferEvent::Delivered { path, complete, .. } => {
                assert!(complete);
                assert_eq!(std::fs::read(path).unwrap(), body);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(f.events.try_recv().is_err());
    }
}
