//! Content-addressed index of received attachments.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    /// Hex BLAKE3 hash of the contents.
    pub hash: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct AttachmentIndex {
    dir: PathBuf,
    by_hash: HashMap<String, AttachmentRecord>,
    by_name: HashMap<String, String>,
}

/// BLAKE3 hash and length of a file, read in a streaming fashion.
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hasher.finalize().to_hex().to_string(), size))
}

impl AttachmentIndex {
    /// Open `dir` (creating it) and index every regular file already in it.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut index = Self {
            dir: dir.to_path_buf(),
            by_hash: HashMap::new(),
            by_name: HashMap::new(),
        };

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let (hash, size) = hash_file(&path)?;
            debug!(name = %name, hash = %hash, "indexed attachment");
            index.insert(AttachmentRecord {
                hash,
                name,
                path,
                size,
            });
        }

        info!(dir = %dir.display(), count = index.len(), "attachment index ready");
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&AttachmentRecord> {
        self.by_hash.get(hash)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AttachmentRecord> {
        self.by_name.get(name).and_then(|hash| self.by_hash.get(hash))
    }

    /// Record a file. A second file with the same contents keeps the first
    /// record for hash lookups but is still reachable by name.
    pub fn insert(&mut self, record: AttachmentRecord) {
        self.by_name.insert(record.name.clone(), record.hash.clone());
        self.by_hash.entry(record.hash.clone()).or_insert(record);
    }

    /// A path in the attachment directory for `name` that is not taken yet:
    /// `name`, then `stem-1.ext`, `stem-2.ext`, ...
    pub fn free_path(&self, name: &str) -> PathBuf {
        let candidate = self.dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (name, None),
        };
        (1u32..)
            .map(|n| match ext {
                Some(ext) => self.dir.join(format!("{stem}-{n}.{ext}")),
                None => self.dir.join(format!("{stem}-{n}")),
            })
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"skip").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let index = AttachmentIndex::open(dir.path()).unwrap();
        assert_eq!(index.len(), 1);

        let hash = blake3::hash(b"alpha").to_hex().to_string();
        let record = index.get(&hash).unwrap();
        assert_eq!(record.name, "a.txt");
        assert_eq!(record.size, 5);
        assert_eq!(index.find_by_name("a.txt").unwrap().hash, hash);
    }

    #[test]
    fn test_free_path_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let index = AttachmentIndex::open(dir.path()).unwrap();
        assert_eq!(index.free_path("r.pdf"), dir.path().join("r.pdf"));

        std::fs::write(dir.path().join("r.pdf"), b"1").unwrap();
        std::fs::write(dir.path().join("r-1.pdf"), b"2").unwrap();
        assert_eq!(index.free_path("r.pdf"), dir.path().join("r-2.pdf"));

        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(index.free_path("README"), dir.path().join("README-1"));
    }
}
