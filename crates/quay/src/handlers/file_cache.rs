//! In-memory static file cache
//!
//! Bounded by total bytes, per-file size and file count. Entries are checked
//! against the file's modification time and length on every hit; the oldest
//! entries are evicted first.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

struct CachedFile {
    body: Bytes,
    modified: Option<SystemTime>,
    /// Insertion order
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PathBuf, CachedFile>,
    used: usize,
    next_seq: u64,
}

/// Byte-budget file cache
pub struct FileCache {
    inner: RwLock<Inner>,
    max_bytes: usize,
    max_file_size: usize,
    max_files: usize,
}

impl FileCache {
    pub fn new(max_bytes: usize, max_file_size: usize, max_files: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_bytes,
            max_file_size: max_file_size.min(max_bytes),
            max_files,
        }
    }

    /// Cached contents, if still current for `meta`
    pub fn get(&self, path: &Path, meta: &std::fs::Metadata) -> Option<Bytes> {
        let modified = meta.modified().ok();
        {
            let inner = self.inner.read();
            let entry = inner.entries.get(path)?;
            if entry.modified == modified && entry.body.len() as u64 == meta.len() {
                return Some(entry.body.clone());
            }
        }

        // Stale
        let mut inner = self.inner.write();
        if let Some(stale) = inner.entries.remove(path) {
            inner.used -= stale.body.len();
        }
        None
    }

    /// Store contents if they fit the limits
    pub fn insert(&self, path: &Path, meta: &std::fs::Metadata, body: Bytes) {
        if body.len() > self.max_file_size || self.max_files == 0 {
            return;
        }

        let mut inner = self.inner.write();
        if let Some(old) = inner.entries.remove(path) {
            inner.used -= old.body.len();
        }

        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_files || inner.used + body.len() > self.max_bytes)
        {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());
            match oldest.and_then(|k| inner.entries.remove(&k)) {
                Some(evicted) => inner.used -= evicted.body.len(),
                None => break,
            }
        }

        inner.used += body.len();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.insert(
            path.to_path_buf(),
            CachedFile {
                body,
                modified: meta.modified().ok(),
                seq,
            },
        );
    }

    /// Number of cached files
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently cached
    pub fn used_bytes(&self) -> usize {
        self.inner.read().used
    }
}
