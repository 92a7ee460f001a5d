use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quire_types::{BlockInfo, KeyPair};

use crate::error::LogResult;
use crate::file::FileStorage;
use crate::memory::MemoryStorage;

/// Everything a storage backend remembers about a feed.
#[derive(Clone, Debug, Default)]
pub struct StoredFeed {
    /// Key material, `None` for storage that was never used.
    pub keys: Option<KeyPair>,
    /// Known block infos, index `i` describing block `i`.
    pub infos: Vec<BlockInfo>,
    /// Indices of blocks whose data is held locally, ascending.
    pub present: Vec<u64>,
}

/// Byte-level backend behind a single feed.
///
/// All implementations must satisfy these invariants:
/// - Blocks are immutable once stored; storing a block twice is a no-op.
/// - Infos may be announced before the matching block data arrives.
/// - All I/O errors are propagated, never silently ignored.
pub trait BlockStorage: Send + Sync + fmt::Debug {
    /// Load key material, block infos and the set of present blocks.
    fn load(&self) -> LogResult<StoredFeed>;

    /// Persist the feed's key material.
    fn write_key(&self, keys: &KeyPair) -> LogResult<()>;

    /// Persist infos for blocks `from..from + infos.len()`.
    fn put_infos(&self, from: u64, infos: &[BlockInfo]) -> LogResult<()>;

    /// Persist the data of block `index`.
    fn put_block(&self, index: u64, data: &[u8]) -> LogResult<()>;

    /// Read the data of block `index`, `Ok(None)` if it is not held.
    fn get_block(&self, index: u64) -> LogResult<Option<Bytes>>;
}

/// Hands out per-feed storage by name (`"metadata"`, `"content"`).
pub trait StorageProvider: Send + Sync + fmt::Debug {
    fn feed_storage(&self, name: &str) -> LogResult<Box<dyn BlockStorage>>;
}

/// In-memory provider. Asking twice for the same name returns the same
/// storage, so a drive can be dropped and reopened within a process.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    feeds: Mutex<HashMap<String, Arc<MemoryStorage>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryProvider {
    fn feed_storage(&self, name: &str) -> LogResult<Box<dyn BlockStorage>> {
        let mut feeds = self.feeds.lock().expect("provider lock poisoned");
        let storage = feeds
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new()));
        Ok(Box::new(Arc::clone(storage)))
    }
}

/// Provider rooted at a directory: feed `name` lives in `root/name/`.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for DirectoryProvider {
    fn feed_storage(&self, name: &str) -> LogResult<Box<dyn BlockStorage>> {
        Ok(Box::new(FileStorage::open(&self.root.join(name))?))
    }
}

impl<S: BlockStorage + ?Sized> BlockStorage for Arc<S> {
    fn load(&self) -> LogResult<StoredFeed> {
        (**self).load()
    }

    fn write_key(&self, keys: &KeyPair) -> LogResult<()> {
        (**self).write_key(keys)
    }

    fn put_infos(&self, from: u64, infos: &[BlockInfo]) -> LogResult<()> {
        (**self).put_infos(from, infos)
    }

    fn put_block(&self, index: u64, data: &[u8]) -> LogResult<()> {
        (**self).put_block(index, data)
    }

    fn get_block(&self, index: u64) -> LogResult<Option<Bytes>> {
        (**self).get_block(index)
    }
}
