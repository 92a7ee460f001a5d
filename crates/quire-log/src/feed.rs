use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use quire_types::{BlockInfo, DiscoveryKey, FeedKey, KeyPair};

use crate::error::{LogError, LogResult};
use crate::reservation::{Reservation, ReservationStats, Want};
use crate::storage::BlockStorage;

/// Options for opening a feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedOptions {
    /// Only fetch blocks that are explicitly wanted (reserved or read).
    pub sparse: bool,
}

/// An append-only sequence of immutable blocks.
///
/// A feed knows the [`BlockInfo`] (size and id) of every block up to its
/// length, but may hold only some of the block data (a sparse replica).
/// Cumulative block sizes let it translate byte offsets into block indices
/// without the data being present.
///
/// `Feed` is a cheap handle; clones share the same log.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    keys: KeyPair,
    discovery_key: DiscoveryKey,
    writable: bool,
    sparse: bool,
    storage: Box<dyn BlockStorage>,
    state: Mutex<FeedState>,
    /// Bumped on every change: appends, arriving blocks, learned infos and
    /// changes to the wanted set.
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct FeedState {
    infos: Vec<BlockInfo>,
    /// `ends[i]` is the byte length of the feed through block `i`.
    ends: Vec<u64>,
    present: Vec<bool>,
    downloaded: u64,
    wants: BTreeMap<u64, Want>,
    next_want: u64,
    /// Blocks awaited by `get`, with the number of waiters.
    gets: BTreeMap<u64, usize>,
    stats: ReservationStats,
}

impl FeedState {
    fn len(&self) -> u64 {
        self.infos.len() as u64
    }

    fn byte_len(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Byte position where block `index` starts.
    fn byte_start(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.ends[index as usize - 1]
        }
    }

    fn push_info(&mut self, info: BlockInfo) {
        let end = self.byte_len() + info.size;
        self.infos.push(info);
        self.ends.push(end);
        self.present.push(false);
    }

    fn is_present(&self, index: u64) -> bool {
        self.present.get(index as usize).copied().unwrap_or(false)
    }

    fn mark_present(&mut self, index: u64) {
        if let Some(slot) = self.present.get_mut(index as usize) {
            if !*slot {
                *slot = true;
                self.downloaded += 1;
            }
        }
    }
}

impl Feed {
    /// Create a new writable feed, or reopen the one held by `storage`.
    pub fn create(storage: Box<dyn BlockStorage>, options: FeedOptions) -> LogResult<Self> {
        let stored = storage.load()?;
        let keys = match stored.keys.clone() {
            Some(keys) => keys,
            None => {
                let keys = KeyPair::generate();
                storage.write_key(&keys)?;
                keys
            }
        };
        Self::from_parts(storage, keys, stored.infos, stored.present, options)
    }

    /// Open the feed identified by `key`. Writable only if the storage
    /// already holds the matching secret.
    pub fn open(
        storage: Box<dyn BlockStorage>,
        key: FeedKey,
        options: FeedOptions,
    ) -> LogResult<Self> {
        let stored = storage.load()?;
        let keys = match stored.keys.clone() {
            Some(keys) if keys.public == key => keys,
            Some(keys) => {
                return Err(LogError::KeyMismatch {
                    stored: keys.public,
                    expected: key,
                })
            }
            None => {
                let keys = KeyPair::public_only(key);
                storage.write_key(&keys)?;
                keys
            }
        };
        Self::from_parts(storage, keys, stored.infos, stored.present, options)
    }

    fn from_parts(
        storage: Box<dyn BlockStorage>,
        keys: KeyPair,
        infos: Vec<BlockInfo>,
        present: Vec<u64>,
        options: FeedOptions,
    ) -> LogResult<Self> {
        let mut state = FeedState::default();
        for info in infos {
            state.push_info(info);
        }
        for index in present {
            state.mark_present(index);
        }

        let (changed, _) = watch::channel(0);
        let writable = keys.is_writable();
        debug!(
            feed = %keys.public.short_id(),
            length = state.len(),
            downloaded = state.downloaded,
            writable,
            "feed opened"
        );
        Ok(Self {
            inner: Arc::new(FeedInner {
                discovery_key: keys.public.discovery_key(),
                keys,
                writable,
                sparse: options.sparse,
                storage,
                state: Mutex::new(state),
                changed,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.inner.state.lock().expect("feed lock poisoned")
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|generation| *generation += 1);
    }

    // ---- Identity ----

    pub fn key(&self) -> FeedKey {
        self.inner.keys.public
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery_key
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    pub fn sparse(&self) -> bool {
        self.inner.sparse
    }

    /// Returns `true` if both handles refer to the same log.
    pub fn same_feed(&self, other: &Feed) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- Lengths ----

    /// Number of blocks known (held or not).
    pub fn len(&self) -> u64 {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total byte length of all known blocks.
    pub fn byte_len(&self) -> u64 {
        self.state().byte_len()
    }

    /// Number of blocks held locally.
    pub fn downloaded_len(&self) -> u64 {
        self.state().downloaded
    }

    // ---- Append ----

    /// Append one block, returning its index.
    pub fn append(&self, data: impl Into<Bytes>) -> LogResult<u64> {
        self.append_inner(None, data.into())
    }

    /// Append one block only if the feed currently has `expected_len`
    /// blocks.
    pub fn compare_and_append(&self, expected_len: u64, data: impl Into<Bytes>) -> LogResult<u64> {
        self.append_inner(Some(expected_len), data.into())
    }

    fn append_inner(&self, expected_len: Option<u64>, data: Bytes) -> LogResult<u64> {
        if !self.inner.writable {
            return Err(LogError::NotWritable(self.key()));
        }
        let index = {
            let mut state = self.state();
            let index = state.len();
            if let Some(expected) = expected_len {
                if expected != index {
                    return Err(LogError::LengthMismatch {
                        expected,
                        actual: index,
                    });
                }
            }
            self.inner.storage.put_block(index, &data)?;
            state.push_info(BlockInfo::of(&data));
            state.mark_present(index);
            index
        };
        debug!(feed = %self.key().short_id(), index, size = data.len(), "append");
        self.notify();
        Ok(index)
    }

    // ---- Read ----

    /// Returns `true` if block `index` is held locally.
    pub fn has(&self, index: u64) -> bool {
        self.state().is_present(index)
    }

    /// Returns `true` if every block in `range` is held locally.
    pub fn has_range(&self, range: Range<u64>) -> bool {
        let state = self.state();
        range.end <= state.len() && range.clone().all(|i| state.is_present(i))
    }

    /// Number of blocks in `range` held locally.
    pub fn downloaded(&self, range: Range<u64>) -> u64 {
        let state = self.state();
        let end = range.end.min(state.len());
        (range.start..end).filter(|&i| state.is_present(i)).count() as u64
    }

    /// Read block `index` if it is held locally.
    pub fn get_local(&self, index: u64) -> LogResult<Option<Bytes>> {
        if !self.has(index) {
            return Ok(None);
        }
        self.inner.storage.get_block(index)
    }

    /// Read block `index`, waiting for it to be appended or replicated.
    ///
    /// While waiting, the block counts as wanted so replication sessions
    /// fetch it even on sparse feeds.
    pub async fn get(&self, index: u64) -> LogResult<Bytes> {
        let mut changes = self.inner.changed.subscribe();
        if let Some(data) = self.get_local(index)? {
            return Ok(data);
        }

        let _pending = PendingGet::register(self, index);
        loop {
            if let Some(data) = self.get_local(index)? {
                return Ok(data);
            }
            // The sender lives as long as `self`, so this never errors.
            let _ = changes.changed().await;
        }
    }

    /// Wait until the feed knows at least `min_len` blocks.
    pub async fn update(&self, min_len: u64) {
        let mut changes = self.inner.changed.subscribe();
        while self.len() < min_len {
            let _ = changes.changed().await;
        }
    }

    /// Wait until every block in `range` is held locally.
    pub async fn wait_for_range(&self, range: Range<u64>) {
        let mut changes = self.inner.changed.subscribe();
        while !self.has_range(range.clone()) {
            let _ = changes.changed().await;
        }
    }

    /// Find the block containing absolute byte position `byte_offset`,
    /// searching only `range`. Returns `(index, offset_within_block)`.
    ///
    /// A position equal to the end of the range resolves to
    /// `(range.end, 0)`. Waits until the feed knows the infos of `range`.
    pub async fn seek(&self, byte_offset: u64, range: Range<u64>) -> LogResult<(u64, u64)> {
        self.update(range.end).await;
        let state = self.state();
        let start_byte = state.byte_start(range.start);
        let end_byte = state.byte_start(range.end);
        if byte_offset < start_byte || byte_offset > end_byte {
            return Err(LogError::SeekOutOfRange {
                offset: byte_offset,
                start: start_byte,
                end: end_byte,
            });
        }
        if byte_offset == end_byte {
            return Ok((range.end, 0));
        }

        let ends = &state.ends[range.start as usize..range.end as usize];
        let index = range.start + ends.partition_point(|&end| end <= byte_offset) as u64;
        let offset = byte_offset - state.byte_start(index);
        debug!(feed = %self.key().short_id(), byte_offset, index, offset, "seek");
        Ok((index, offset))
    }

    // ---- Download reservations ----

    /// Reserve `range` for download. `linear` hints that the blocks will be
    /// read in order, so they are fetched first and front to back.
    pub fn download(&self, range: Range<u64>, linear: bool) -> Reservation {
        let id = {
            let mut state = self.state();
            let id = state.next_want;
            state.next_want += 1;
            state.wants.insert(
                id,
                Want {
                    range: range.clone(),
                    linear,
                },
            );
            state.stats.acquired += 1;
            id
        };
        debug!(feed = %self.key().short_id(), id, start = range.start, end = range.end, linear, "reserve");
        self.notify();
        Reservation::new(self.clone(), id, range)
    }

    pub(crate) fn release_want(&self, id: u64) {
        let removed = {
            let mut state = self.state();
            let removed = state.wants.remove(&id).is_some();
            if removed {
                state.stats.released += 1;
            }
            removed
        };
        if removed {
            debug!(feed = %self.key().short_id(), id, "release");
            self.notify();
        }
    }

    /// Counters for acquired and released reservations.
    pub fn reservation_stats(&self) -> ReservationStats {
        let state = self.state();
        ReservationStats {
            active: state.wants.len() as u64,
            ..state.stats
        }
    }

    // ---- Replication support ----

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    /// Infos for blocks `from..len`.
    pub fn infos_from(&self, from: u64) -> Vec<BlockInfo> {
        let state = self.state();
        state
            .infos
            .get(from as usize..)
            .map(<[BlockInfo]>::to_vec)
            .unwrap_or_default()
    }

    /// Runs of locally held blocks as half-open `(start, end)` pairs.
    pub fn present_ranges(&self) -> Vec<(u64, u64)> {
        let state = self.state();
        let mut ranges = Vec::new();
        let mut run: Option<u64> = None;
        for (i, &present) in state.present.iter().enumerate() {
            match (present, run) {
                (true, None) => run = Some(i as u64),
                (false, Some(start)) => {
                    ranges.push((start, i as u64));
                    run = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run {
            ranges.push((start, state.len()));
        }
        ranges
    }

    /// Accept block infos announced by a peer for blocks `from..`.
    ///
    /// Writable feeds are authoritative and ignore announcements. Returns
    /// `true` if the feed grew.
    pub fn learn(&self, from: u64, infos: &[BlockInfo]) -> LogResult<bool> {
        if self.inner.writable || infos.is_empty() {
            return Ok(false);
        }
        let grew = {
            let mut state = self.state();
            let len = state.len();
            if from > len {
                return Err(LogError::Protocol(format!(
                    "block infos start at {from} beyond length {len}"
                )));
            }
            for (i, info) in infos.iter().enumerate() {
                let index = from + i as u64;
                if index < len && state.infos[index as usize] != *info {
                    return Err(LogError::ConflictingInfo { index });
                }
            }
            let skip = (len - from) as usize;
            let fresh = infos.get(skip..).unwrap_or_default();
            if !fresh.is_empty() {
                self.inner.storage.put_infos(len, fresh)?;
                for info in fresh {
                    state.push_info(*info);
                }
            }
            !fresh.is_empty()
        };
        if grew {
            debug!(feed = %self.key().short_id(), length = self.len(), "learned infos");
            self.notify();
        }
        Ok(grew)
    }

    /// Store a block received from a peer after verifying it against the
    /// known block id. Returns `true` if the block was new.
    pub fn put(&self, index: u64, data: &[u8]) -> LogResult<bool> {
        {
            let mut state = self.state();
            let info = *state.infos.get(index as usize).ok_or(LogError::OutOfRange {
                index,
                length: state.len(),
            })?;
            if info.size != data.len() as u64 || !info.id.verify(data) {
                return Err(LogError::BlockMismatch { index });
            }
            if state.is_present(index) {
                return Ok(false);
            }
            self.inner.storage.put_block(index, data)?;
            state.mark_present(index);
        }
        debug!(feed = %self.key().short_id(), index, size = data.len(), "stored block");
        self.notify();
        Ok(true)
    }

    /// Up to `limit` missing blocks worth requesting, most urgent first:
    /// blocks awaited by `get`, then linear reservations, then other
    /// reservations, then (for non-sparse feeds) everything else.
    pub fn wanted_blocks(&self, limit: usize, mut accept: impl FnMut(u64) -> bool) -> Vec<u64> {
        let state = self.state();
        let len = state.len();
        let mut picked = Vec::new();
        let mut seen = HashSet::new();
        let mut consider = |index: u64, picked: &mut Vec<u64>| -> bool {
            if picked.len() >= limit {
                return false;
            }
            if index < len && !state.is_present(index) && seen.insert(index) && accept(index) {
                picked.push(index);
            }
            true
        };

        for &index in state.gets.keys() {
            if !consider(index, &mut picked) {
                return picked;
            }
        }
        let mut wants: Vec<&Want> = state.wants.values().collect();
        wants.sort_by_key(|want| (!want.linear, want.range.start));
        for want in wants {
            for index in want.range.start..want.range.end.min(len) {
                if !consider(index, &mut picked) {
                    return picked;
                }
            }
        }
        if !self.inner.sparse {
            for index in 0..len {
                if !consider(index, &mut picked) {
                    return picked;
                }
            }
        }
        picked
    }
}

/// Marks a block as awaited for the lifetime of a `get` call.
struct PendingGet {
    feed: Feed,
    index: u64,
}

impl PendingGet {
    fn register(feed: &Feed, index: u64) -> Self {
        *feed.state().gets.entry(index).or_insert(0) += 1;
        feed.notify();
        Self {
            feed: feed.clone(),
            index,
        }
    }
}

impl Drop for PendingGet {
    fn drop(&mut self) {
        let mut state = self.feed.state();
        if let Some(count) = state.gets.get_mut(&self.index) {
            *count -= 1;
            if *count == 0 {
                state.gets.remove(&self.index);
            }
        }
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Feed")
            .field("key", &self.inner.keys.public)
            .field("writable", &self.inner.writable)
            .field("sparse", &self.inner.sparse)
            .field("length", &state.len())
            .field("downloaded", &state.downloaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use std::time::Duration;

    fn writable() -> Feed {
        Feed::create(Box::new(MemoryStorage::new()), FeedOptions::default()).unwrap()
    }

    fn replica_of(origin: &Feed, sparse: bool) -> Feed {
        Feed::open(
            Box::new(MemoryStorage::new()),
            origin.key(),
            FeedOptions { sparse },
        )
        .unwrap()
    }

    /// Feed with blocks "ab", "cde", "f", "ghij" (byte ends 2, 5, 6, 10).
    fn sample() -> Feed {
        let feed = writable();
        for block in ["ab", "cde", "f", "ghij"] {
            feed.append(block.as_bytes().to_vec()).unwrap();
        }
        feed
    }

    #[test]
    fn append_tracks_lengths() {
        let feed = sample();
        assert_eq!(feed.len(), 4);
        assert_eq!(feed.byte_len(), 10);
        assert_eq!(feed.downloaded_len(), 4);
        assert!(feed.has_range(0..4));
    }

    #[test]
    fn compare_and_append_rejects_stale_length() {
        let feed = writable();
        assert_eq!(feed.compare_and_append(0, &b"index"[..]).unwrap(), 0);
        let err = feed.compare_and_append(0, &b"again"[..]).unwrap_err();
        assert!(matches!(
            err,
            LogError::LengthMismatch {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn replica_is_not_writable() {
        let origin = writable();
        let replica = replica_of(&origin, false);
        assert!(!replica.writable());
        assert!(matches!(
            replica.append(&b"x"[..]),
            Err(LogError::NotWritable(_))
        ));
    }

    #[test]
    fn open_rejects_foreign_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let feed = Feed::create(Box::new(Arc::clone(&storage)), FeedOptions::default()).unwrap();
        let other = FeedKey::from_raw([1; 32]);
        let err = Feed::open(Box::new(storage), other, FeedOptions::default()).unwrap_err();
        assert!(matches!(err, LogError::KeyMismatch { .. }));
        drop(feed);
    }

    #[test]
    fn reopen_keeps_writability_and_blocks() {
        let storage = Arc::new(MemoryStorage::new());
        let feed = Feed::create(Box::new(Arc::clone(&storage)), FeedOptions::default()).unwrap();
        feed.append(&b"persisted"[..]).unwrap();
        let key = feed.key();
        drop(feed);

        let reopened = Feed::open(Box::new(storage), key, FeedOptions::default()).unwrap();
        assert!(reopened.writable());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.byte_len(), 9);
    }

    #[tokio::test]
    async fn get_returns_appended_block() {
        let feed = sample();
        assert_eq!(feed.get(1).await.unwrap(), Bytes::from_static(b"cde"));
    }

    #[tokio::test]
    async fn get_waits_for_append() {
        let feed = writable();
        let reader = feed.clone();
        let pending = tokio::spawn(async move { reader.get(0).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.append(&b"late"[..]).unwrap();
        assert_eq!(pending.await.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn seek_maps_bytes_to_blocks() {
        let feed = sample();
        assert_eq!(feed.seek(0, 0..4).await.unwrap(), (0, 0));
        assert_eq!(feed.seek(1, 0..4).await.unwrap(), (0, 1));
        assert_eq!(feed.seek(2, 0..4).await.unwrap(), (1, 0));
        assert_eq!(feed.seek(4, 0..4).await.unwrap(), (1, 2));
        assert_eq!(feed.seek(5, 0..4).await.unwrap(), (2, 0));
        assert_eq!(feed.seek(9, 0..4).await.unwrap(), (3, 3));
    }

    #[tokio::test]
    async fn seek_to_range_end_is_exclusive_end() {
        let feed = sample();
        assert_eq!(feed.seek(10, 0..4).await.unwrap(), (4, 0));
        assert_eq!(feed.seek(6, 1..3).await.unwrap(), (3, 0));
    }

    #[tokio::test]
    async fn seek_within_subrange() {
        let feed = sample();
        assert_eq!(feed.seek(3, 1..3).await.unwrap(), (1, 1));
        let err = feed.seek(1, 1..3).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::SeekOutOfRange {
                offset: 1,
                start: 2,
                end: 6
            }
        ));
    }

    #[tokio::test]
    async fn seek_in_empty_range() {
        let feed = sample();
        assert_eq!(feed.seek(5, 2..2).await.unwrap(), (2, 0));
    }

    #[test]
    fn reservations_count_acquire_and_release() {
        let feed = sample();
        let first = feed.download(0..2, true);
        let second = feed.download(1..4, false);
        assert_eq!(feed.reservation_stats().active, 2);

        first.release();
        drop(second);
        let stats = feed.reservation_stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn learn_and_put_fill_a_replica() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        assert!(replica.learn(0, &origin.infos_from(0)).unwrap());
        assert_eq!(replica.len(), 4);
        assert_eq!(replica.byte_len(), 10);
        assert_eq!(replica.downloaded_len(), 0);

        let data = origin.get_local(1).unwrap().unwrap();
        assert!(replica.put(1, &data).unwrap());
        assert!(!replica.put(1, &data).unwrap());
        assert_eq!(replica.downloaded(0..4), 1);
        assert_eq!(replica.present_ranges(), vec![(1, 2)]);
    }

    #[test]
    fn put_rejects_tampered_block() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        replica.learn(0, &origin.infos_from(0)).unwrap();
        let err = replica.put(0, b"xx").unwrap_err();
        assert!(matches!(err, LogError::BlockMismatch { index: 0 }));
    }

    #[test]
    fn learn_rejects_conflicts_and_gaps() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        replica.learn(0, &origin.infos_from(0)[..2]).unwrap();

        let err = replica.learn(0, &[BlockInfo::of(b"zz")]).unwrap_err();
        assert!(matches!(err, LogError::ConflictingInfo { index: 0 }));
        assert!(replica.learn(5, &origin.infos_from(0)).is_err());

        // overlapping announcement extends without conflict
        assert!(replica.learn(1, &origin.infos_from(1)).unwrap());
        assert_eq!(replica.len(), 4);
    }

    #[test]
    fn wanted_blocks_prioritises_linear_reservations() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        replica.learn(0, &origin.infos_from(0)).unwrap();
        assert!(replica.wanted_blocks(8, |_| true).is_empty());

        let _other = replica.download(0..1, false);
        let _linear = replica.download(2..4, true);
        assert_eq!(replica.wanted_blocks(8, |_| true), vec![2, 3, 0]);
        assert_eq!(replica.wanted_blocks(2, |_| true), vec![2, 3]);
        assert_eq!(replica.wanted_blocks(8, |i| i != 3), vec![2, 0]);
    }

    #[test]
    fn non_sparse_replica_wants_everything() {
        let origin = sample();
        let replica = replica_of(&origin, false);
        replica.learn(0, &origin.infos_from(0)).unwrap();
        replica
            .put(1, &origin.get_local(1).unwrap().unwrap())
            .unwrap();
        assert_eq!(replica.wanted_blocks(8, |_| true), vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn pending_get_is_wanted_until_dropped() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        replica.learn(0, &origin.infos_from(0)).unwrap();

        let reader = replica.clone();
        let pending = tokio::spawn(async move { reader.get(3).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(replica.wanted_blocks(8, |_| true), vec![3]);

        replica
            .put(3, &origin.get_local(3).unwrap().unwrap())
            .unwrap();
        assert_eq!(pending.await.unwrap(), Bytes::from_static(b"ghij"));
        assert!(replica.wanted_blocks(8, |_| true).is_empty());
    }

    #[tokio::test]
    async fn wait_for_range_resolves_when_filled() {
        let origin = sample();
        let replica = replica_of(&origin, true);
        replica.learn(0, &origin.infos_from(0)).unwrap();

        let waiter = replica.clone();
        let done = tokio::spawn(async move { waiter.wait_for_range(0..2).await });
        for index in 0..2 {
            replica
                .put(index, &origin.get_local(index).unwrap().unwrap())
                .unwrap();
        }
        done.await.unwrap();
        assert!(replica.has_range(0..2));
    }
}
