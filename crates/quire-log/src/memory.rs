use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;
use quire_types::{BlockInfo, KeyPair};

use crate::error::LogResult;
use crate::storage::{BlockStorage, StoredFeed};

/// In-memory block storage.
///
/// Intended for tests and embedding. Everything lives behind a `RwLock`;
/// block payloads are `Bytes`, so reads are cheap clones.
pub struct MemoryStorage {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    keys: Option<KeyPair>,
    infos: Vec<BlockInfo>,
    blocks: BTreeMap<u64, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of blocks held.
    pub fn block_count(&self) -> usize {
        self.inner.read().expect("lock poisoned").blocks.len()
    }

    /// Total payload bytes held.
    pub fn total_bytes(&self) -> u64 {
        self.inner
            .read()
            .expect("lock poisoned")
            .blocks
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStorage for MemoryStorage {
    fn load(&self) -> LogResult<StoredFeed> {
        let state = self.inner.read().expect("lock poisoned");
        let mut infos = state.infos.clone();
        for (&index, data) in &state.blocks {
            set_info(&mut infos, index, BlockInfo::of(data));
        }
        Ok(StoredFeed {
            keys: state.keys.clone(),
            infos,
            present: state.blocks.keys().copied().collect(),
        })
    }

    fn write_key(&self, keys: &KeyPair) -> LogResult<()> {
        self.inner.write().expect("lock poisoned").keys = Some(keys.clone());
        Ok(())
    }

    fn put_infos(&self, from: u64, infos: &[BlockInfo]) -> LogResult<()> {
        let mut state = self.inner.write().expect("lock poisoned");
        for (offset, info) in infos.iter().enumerate() {
            set_info(&mut state.infos, from + offset as u64, *info);
        }
        Ok(())
    }

    fn put_block(&self, index: u64, data: &[u8]) -> LogResult<()> {
        let mut state = self.inner.write().expect("lock poisoned");
        state
            .blocks
            .entry(index)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get_block(&self, index: u64) -> LogResult<Option<Bytes>> {
        Ok(self
            .inner
            .read()
            .expect("lock poisoned")
            .blocks
            .get(&index)
            .cloned())
    }
}

/// Place `info` at `index`, padding unknown slots with the info itself.
///
/// Padding never survives a well-formed feed: infos always arrive as a
/// prefix-complete run, so any padded slot is overwritten by a later call.
pub(crate) fn set_info(infos: &mut Vec<BlockInfo>, index: u64, info: BlockInfo) {
    let index = index as usize;
    if index < infos.len() {
        infos[index] = info;
    } else {
        infos.resize(index, info);
        infos.push(info);
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("block_count", &self.block_count())
            .finish()
    }
}
