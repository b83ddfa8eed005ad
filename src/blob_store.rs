//! Content-addressed local byte storage.
//!
//! A flat keyspace of content id → bytes with first-write-wins semantics:
//! writing an existing key is a no-op, never an in-place replace. No delete
//! or garbage collection is exposed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::content_id::ContentId;

/// Something dereferenceable into locally playable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobHandle {
    /// Bytes live in a local file.
    File(PathBuf),
    /// Bytes live in memory (test stores).
    Bytes(Arc<Vec<u8>>),
}

impl BlobHandle {
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            BlobHandle::File(path) => std::fs::read(path),
            BlobHandle::Bytes(bytes) => Ok(bytes.as_ref().clone()),
        }
    }
}

pub trait BlobStore: Send + Sync {
    fn exists(&self, content_id: &ContentId) -> bool;

    /// Stores bytes under their id. Returns `false` without touching
    /// storage when the key already exists.
    fn write(&self, content_id: &ContentId, bytes: &[u8]) -> io::Result<bool>;

    /// Handle for the stored bytes, or `None` when nothing was persisted.
    fn read(&self, content_id: &ContentId) -> io::Result<Option<BlobHandle>>;
}

/// One file per content id under a flat directory.
pub struct FsBlobStore {
    root: PathBuf,
    bytes_written: AtomicU64,
}

impl FsBlobStore {
    pub fn open(root: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Total bytes this process actually wrote (skipped writes excluded).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn blob_path(&self, content_id: &ContentId) -> PathBuf {
        // Ids are `<algorithm>:<hex>`; keep filenames portable.
        self.root.join(content_id.as_str().replace(':', "-"))
    }
}

impl BlobStore for FsBlobStore {
    fn exists(&self, content_id: &ContentId) -> bool {
        self.blob_path(content_id).exists()
    }

    fn write(&self, content_id: &ContentId, bytes: &[u8]) -> io::Result<bool> {
        let path = self.blob_path(content_id);
        if path.exists() {
            debug!("Blob store: {} already present, skipping write", content_id);
            return Ok(false);
        }
        write_via_tempfile(&path, bytes)?;
        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    fn read(&self, content_id: &ContentId) -> io::Result<Option<BlobHandle>> {
        let path = self.blob_path(content_id);
        if path.exists() {
            Ok(Some(BlobHandle::File(path)))
        } else {
            Ok(None)
        }
    }
}

/// Concurrent writers of the same id race on the final rename, which
/// replaces the file with identical bytes either way.
fn write_via_tempfile(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("part");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<ContentId, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn exists(&self, content_id: &ContentId) -> bool {
        self.blobs
            .lock()
            .expect("blob map lock poisoned")
            .contains_key(content_id)
    }

    fn write(&self, content_id: &ContentId, bytes: &[u8]) -> io::Result<bool> {
        let mut blobs = self.blobs.lock().expect("blob map lock poisoned");
        if blobs.contains_key(content_id) {
            return Ok(false);
        }
        blobs.insert(content_id.clone(), Arc::new(bytes.to_vec()));
        Ok(true)
    }

    fn read(&self, content_id: &ContentId) -> io::Result<Option<BlobHandle>> {
        Ok(self
            .blobs
            .lock()
            .expect("blob map lock poisoned")
            .get(content_id)
            .map(|bytes| BlobHandle::Bytes(Arc::clone(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FsBlobStore::open(dir.path().join("tracks")).expect("open");
        let id = ContentId::from_bytes(b"track bytes");

        assert!(!store.exists(&id));
        assert!(store.read(&id).expect("read").is_none());

        assert!(store.write(&id, b"track bytes").expect("write"));
        assert!(store.exists(&id));
        let handle = store.read(&id).expect("read").expect("handle");
        assert_eq!(handle.into_bytes().expect("bytes"), b"track bytes");
        assert_eq!(store.bytes_written(), b"track bytes".len() as u64);
    }

    #[test]
    fn test_fs_store_first_write_wins() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FsBlobStore::open(dir.path().join("tracks")).expect("open");
        let id = ContentId::from_bytes(b"original");

        assert!(store.write(&id, b"original").expect("write"));
        // Same key again, even with different bytes, is a no-op.
        assert!(!store.write(&id, b"impostor").expect("rewrite"));

        let handle = store.read(&id).expect("read").expect("handle");
        assert_eq!(handle.into_bytes().expect("bytes"), b"original");
        assert_eq!(store.bytes_written(), b"original".len() as u64);
    }

    #[test]
    fn test_memory_store_first_write_wins() {
        let store = MemoryBlobStore::new();
        let id = ContentId::from_bytes(b"original");

        assert!(store.write(&id, b"original").expect("write"));
        assert!(!store.write(&id, b"impostor").expect("rewrite"));
        let handle = store.read(&id).expect("read").expect("handle");
        assert_eq!(handle.into_bytes().expect("bytes"), b"original");
    }
}
