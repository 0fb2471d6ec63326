//! Bounded cache of file content hashes computed during one build pass

use crate::types::FileStat;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const READ_HASH_CACHE_CAPACITY: usize = 256;

/// Hex sha256 of file contents, the form recorded as a bundle's `hash`
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// LRU keyed by `(path, size, mtime)`, so a rewritten file never hits a stale hash
#[derive(Debug)]
pub struct ReadHashCache {
    entries: Mutex<LruCache<(PathBuf, u64, i64), String>>,
    hashed: AtomicUsize,
}

impl Default for ReadHashCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadHashCache {
    pub fn new() -> Self {
        Self::with_capacity(READ_HASH_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hashed: AtomicUsize::new(0),
        }
    }

    /// Hash `path`, reusing a previous result for the same fingerprint
    pub fn hash_file(&self, path: &Path, stat: &FileStat) -> std::io::Result<String> {
        let key = (path.to_path_buf(), stat.size, stat.mtime_ms);
        if let Ok(mut entries) = self.entries.lock()
            && let Some(hash) = entries.get(&key)
        {
            return Ok(hash.clone());
        }

        let bytes = std::fs::read(path)?;
        let hash = content_hash(&bytes);
        self.hashed.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, hash.clone());
        }
        Ok(hash)
    }

    /// Number of files actually read and hashed so far
    pub fn files_hashed(&self) -> usize {
        self.hashed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
