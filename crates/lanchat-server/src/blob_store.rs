use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Hex BLAKE3 digests are the only ids this store hands out or accepts.
fn is_blob_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Content-addressed attachment storage: one file per distinct payload,
/// named by its BLAKE3 hash.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store `data` under its hash. Returns the id and whether a new file
    /// was written; identical uploads share one file.
    pub async fn store(&self, data: &[u8]) -> Result<(String, bool), ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = blake3::hash(data).to_hex().to_string();
        let path = self.blob_path(&id)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(id = %id, "Attachment already stored");
            return Ok((id, false));
        }

        // Write under a unique temporary name so a concurrent upload of the
        // same bytes never observes a half-written file.
        let tmp = self.base_path.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, data)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to write attachment {}: {}", id, e)))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ServerError::Storage(format!(
                "Failed to commit attachment {}: {}",
                id, e
            )));
        }

        debug!(id = %id, size = data.len(), "Stored attachment");
        Ok((id, true))
    }

    pub async fn read(&self, id: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.blob_path(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("attachment {id}")))
            }
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to read attachment {}: {}",
                id, e
            ))),
        }
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf, ServerError> {
        if !is_blob_id(id) {
            return Err(ServerError::BadRequest(format!("Invalid attachment id: {id}")));
        }
        Ok(self.base_path.join(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_read() {
        let (store, _dir) = test_store().await;
        let (id, created) = store.store(b"attachment-bytes").await.unwrap();
        assert!(created);
        assert_eq!(id.len(), 64);
        assert_eq!(store.read(&id).await.unwrap(), b"attachment-bytes");
    }

    #[tokio::test]
    async fn test_identical_uploads_share_one_file() {
        let (store, dir) = test_store().await;
        let (first, created) = store.store(b"same").await.unwrap();
        let (second, again) = store.store(b"same").await.unwrap();
        assert!(created);
        assert!(!again);
        assert_eq!(first, second);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_ids() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(ServerError::BadRequest(_))
        ));
        let missing = "0".repeat(64);
        assert!(matches!(
            store.read(&missing).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_size_limits() {
        let (store, _dir) = test_store().await;
        assert!(store.store(b"").await.is_err());
        assert!(matches!(
            store.store(&[0u8; 1025]).await,
            Err(ServerError::TooLarge { .. })
        ));
    }
}
