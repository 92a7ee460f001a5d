//! The versioned path index replayed from a metadata feed.
//!
//! Entries from `offset` onwards are [`TreeNode`]s. The index version is the
//! feed length: committing a node at position `seq` produces version
//! `seq + 1`. A pinned index (a checkout) replays only up to its version and
//! never advances.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use quire_log::Feed;
use quire_types::{path, FileRecord};

use crate::error::{TreeError, TreeResult};
use crate::node::TreeNode;

/// Feed position of the first tree node; position 0 holds the index record.
pub const DEFAULT_OFFSET: u64 = 1;

/// A change recorded in the metadata feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Put(FileRecord),
    Del,
}

/// One entry of [`PathIndex::history`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Feed position of the node.
    pub seq: u64,
    pub path: String,
    pub change: Change,
}

impl HistoryEntry {
    /// The index version right after this change.
    pub fn version(&self) -> u64 {
        self.seq + 1
    }
}

/// Bounds for [`PathIndex::history`], in feed positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryOptions {
    /// First position (inclusive). Clamped to the index offset.
    pub start: u64,
    /// Last position (exclusive). Defaults to the index version.
    pub end: Option<u64>,
    /// Newest first.
    pub reverse: bool,
}

#[derive(Default)]
struct Replayed {
    version: u64,
    files: BTreeMap<String, FileRecord>,
}

impl Replayed {
    fn apply(&mut self, node: TreeNode) {
        match node.value {
            Some(record) => {
                self.files.insert(node.path, record);
            }
            None => {
                self.files.remove(&node.path);
            }
        }
    }
}

/// Path to [`FileRecord`] tree stored as nodes in a metadata feed.
///
/// Reads replay the feed incrementally into an in-memory map; only nodes
/// appended since the last read are decoded.
pub struct PathIndex {
    feed: Feed,
    offset: u64,
    pinned: Option<u64>,
    replayed: Mutex<Replayed>,
}

impl PathIndex {
    /// Index over `feed` with nodes starting at [`DEFAULT_OFFSET`].
    pub fn new(feed: Feed) -> Self {
        Self::with_offset(feed, DEFAULT_OFFSET)
    }

    pub fn with_offset(feed: Feed, offset: u64) -> Self {
        Self {
            feed,
            offset,
            pinned: None,
            replayed: Mutex::new(Replayed::default()),
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current version: the pinned version, or the feed length.
    pub fn version(&self) -> u64 {
        self.pinned.unwrap_or_else(|| self.feed.len())
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// A read-only view of this index at `version`.
    pub fn checkout(&self, version: u64) -> TreeResult<PathIndex> {
        let current = self.version();
        if version > current {
            return Err(TreeError::InvalidVersion {
                requested: version,
                current,
            });
        }
        debug!(version, current, "path index checkout");
        Ok(Self {
            feed: self.feed.clone(),
            offset: self.offset,
            pinned: Some(version),
            replayed: Mutex::new(Replayed::default()),
        })
    }

    /// Bring the replayed map up to the current version.
    async fn replayed(&self) -> TreeResult<MutexGuard<'_, Replayed>> {
        let target = self.version();
        let mut replayed = self.replayed.lock().await;
        let from = replayed.version.max(self.offset);
        for seq in from..target {
            let node = read_node(&self.feed, seq).await?;
            replayed.apply(node);
            replayed.version = seq + 1;
        }
        if replayed.version < target {
            replayed.version = target;
        }
        Ok(replayed)
    }

    /// The record at `path`, if any.
    pub async fn get(&self, path: &str) -> TreeResult<Option<FileRecord>> {
        let path = path::normalize(path);
        Ok(self.replayed().await?.files.get(&path).cloned())
    }

    /// Commit `record` at `path`. Returns the new version.
    pub async fn put(&self, path: &str, record: FileRecord) -> TreeResult<u64> {
        let path = self.writable_path(path)?;
        self.append(TreeNode::put(path, record))
    }

    /// Commit a deletion of `path`. Returns the new version.
    pub async fn del(&self, path: &str) -> TreeResult<u64> {
        let path = self.writable_path(path)?;
        self.append(TreeNode::del(path))
    }

    fn writable_path(&self, path: &str) -> TreeResult<String> {
        if let Some(version) = self.pinned {
            return Err(TreeError::Pinned(version));
        }
        if self.feed.len() < self.offset {
            return Err(TreeError::Uninitialized);
        }
        let path = path::normalize(path);
        if path.is_empty() {
            return Err(TreeError::InvalidPath(path));
        }
        Ok(path)
    }

    fn append(&self, node: TreeNode) -> TreeResult<u64> {
        let seq = self.feed.append(node.encode()?)?;
        debug!(seq, path = %node.path, deletion = node.is_deletion(), "tree node committed");
        Ok(seq + 1)
    }

    /// Sorted names of the immediate children of `prefix`.
    pub async fn list(&self, prefix: &str) -> TreeResult<Vec<String>> {
        let prefix = path::normalize(prefix);
        let replayed = self.replayed().await?;
        let names: BTreeSet<&str> = replayed
            .files
            .keys()
            .filter_map(|file| path::child_of(&prefix, file))
            .collect();
        Ok(names.into_iter().map(str::to_string).collect())
    }

    /// Every file at or below `prefix`, in path order.
    pub async fn list_files(&self, prefix: &str) -> TreeResult<Vec<(String, FileRecord)>> {
        let prefix = path::normalize(prefix);
        let replayed = self.replayed().await?;
        Ok(replayed
            .files
            .iter()
            .filter(|(file, _)| path::is_within(&prefix, file))
            .map(|(file, record)| (file.clone(), record.clone()))
            .collect())
    }

    /// The change log between the bounds in `options`.
    ///
    /// Lazy and finite; each call starts a fresh stream.
    pub fn history(&self, options: HistoryOptions) -> BoxStream<'static, TreeResult<HistoryEntry>> {
        let version = self.version();
        let start = options.start.max(self.offset);
        let end = options.end.map_or(version, |end| end.min(version));
        let seqs: Box<dyn Iterator<Item = u64> + Send> = if options.reverse {
            Box::new((start..end).rev())
        } else {
            Box::new(start..end)
        };

        stream::unfold((self.feed.clone(), seqs), |(feed, mut seqs)| async move {
            let seq = seqs.next()?;
            let entry = read_node(&feed, seq).await.map(|node| HistoryEntry {
                seq,
                change: match node.value {
                    Some(record) => Change::Put(record),
                    None => Change::Del,
                },
                path: node.path,
            });
            Some((entry, (feed, seqs)))
        })
        .boxed()
    }
}

async fn read_node(feed: &Feed, seq: u64) -> TreeResult<TreeNode> {
    let data = feed.get(seq).await?;
    TreeNode::decode(&data)
}

impl fmt::Debug for PathIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathIndex")
            .field("feed", &self.feed.key())
            .field("offset", &self.offset)
            .field("version", &self.version())
            .field("pinned", &self.pinned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use proptest::prelude::*;
    use quire_log::{FeedOptions, MemoryStorage};

    fn index() -> PathIndex {
        let feed = Feed::create(Box::new(MemoryStorage::new()), FeedOptions::default()).unwrap();
        feed.append(&b"index record"[..]).unwrap();
        PathIndex::new(feed)
    }

    fn record(size: u64) -> FileRecord {
        FileRecord {
            size,
            blocks: 1,
            ..FileRecord::default()
        }
        .into_regular()
    }

    #[tokio::test]
    async fn put_get_and_version() {
        let index = index();
        assert_eq!(index.version(), 1);
        assert_eq!(index.put("/a/1", record(3)).await.unwrap(), 2);
        assert_eq!(index.get("a/1").await.unwrap(), Some(record(3)));
        assert_eq!(index.get("a//1/").await.unwrap(), Some(record(3)));
        assert_eq!(index.get("a/2").await.unwrap(), None);
        assert_eq!(index.version(), 2);
    }

    #[tokio::test]
    async fn later_put_replaces_record() {
        let index = index();
        index.put("f", record(1)).await.unwrap();
        index.put("f", record(9)).await.unwrap();
        assert_eq!(index.get("f").await.unwrap().unwrap().size, 9);
    }

    #[tokio::test]
    async fn del_removes() {
        let index = index();
        index.put("f", record(1)).await.unwrap();
        assert_eq!(index.del("f").await.unwrap(), 3);
        assert_eq!(index.get("f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_children_sorted_unique() {
        let index = index();
        for path in ["a/3", "a/1", "a/2", "a/sub/x", "a/sub/y", "b"] {
            index.put(path, record(1)).await.unwrap();
        }
        assert_eq!(index.list("a").await.unwrap(), vec!["1", "2", "3", "sub"]);
        assert_eq!(index.list("/").await.unwrap(), vec!["a", "b"]);
        assert!(index.list("b").await.unwrap().is_empty());
        assert!(index.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_files_under_prefix() {
        let index = index();
        for path in ["a/1", "a/sub/x", "ab"] {
            index.put(path, record(1)).await.unwrap();
        }
        let files: Vec<String> = index
            .list_files("a")
            .await
            .unwrap()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(files, vec!["a/1", "a/sub/x"]);
    }

    #[tokio::test]
    async fn checkout_is_pinned() {
        let index = index();
        index.put("a/1", record(1)).await.unwrap();
        index.put("a/2", record(2)).await.unwrap();
        let view = index.checkout(3).unwrap();
        index.put("a/3", record(3)).await.unwrap();

        assert_eq!(view.version(), 3);
        assert_eq!(view.list("a").await.unwrap(), vec!["1", "2"]);
        assert!(matches!(
            view.put("a/4", record(4)).await,
            Err(TreeError::Pinned(3))
        ));
        assert_eq!(index.list("a").await.unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn checkout_beyond_version_fails() {
        let index = index();
        let err = index.checkout(5).unwrap_err();
        assert!(matches!(
            err,
            TreeError::InvalidVersion {
                requested: 5,
                current: 1
            }
        ));
    }

    #[tokio::test]
    async fn put_requires_index_record() {
        let feed = Feed::create(Box::new(MemoryStorage::new()), FeedOptions::default()).unwrap();
        let index = PathIndex::new(feed);
        assert!(matches!(
            index.put("a", record(1)).await,
            Err(TreeError::Uninitialized)
        ));
    }

    #[tokio::test]
    async fn root_path_is_rejected() {
        let index = index();
        assert!(matches!(
            index.put("/", record(1)).await,
            Err(TreeError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn history_in_order_and_reverse() {
        let index = index();
        index.put("x", record(1)).await.unwrap();
        index.put("y", record(2)).await.unwrap();
        index.del("x").await.unwrap();

        let entries: Vec<HistoryEntry> = index
            .history(HistoryOptions::default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].change, Change::Put(record(1)));
        assert_eq!(entries[2].path, "x");
        assert_eq!(entries[2].change, Change::Del);
        assert_eq!(entries[2].version(), 4);

        let reversed: Vec<u64> = index
            .history(HistoryOptions {
                reverse: true,
                ..HistoryOptions::default()
            })
            .map_ok(|entry| entry.seq)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(reversed, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn history_respects_bounds_and_checkout() {
        let index = index();
        for path in ["a", "b", "c", "d"] {
            index.put(path, record(1)).await.unwrap();
        }
        let paths: Vec<String> = index
            .history(HistoryOptions {
                start: 2,
                end: Some(4),
                reverse: false,
            })
            .map_ok(|entry| entry.path)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(paths, vec!["b", "c"]);

        let view = index.checkout(3).unwrap();
        let count = view
            .history(HistoryOptions::default())
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .len();
        assert_eq!(count, 2);
    }

    proptest! {
        #[test]
        fn replay_matches_model(ops in proptest::collection::vec((0..4u8, any::<bool>()), 1..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let index = index();
                let mut model = BTreeMap::new();
                for (i, (name, delete)) in ops.into_iter().enumerate() {
                    let path = format!("dir/{name}");
                    if delete {
                        index.del(&path).await.unwrap();
                        model.remove(&path);
                    } else {
                        index.put(&path, record(i as u64)).await.unwrap();
                        model.insert(path, record(i as u64));
                    }
                    // read in between so the cache advances incrementally
                    if i % 3 == 0 {
                        index.get("dir/0").await.unwrap();
                    }
                }
                let files: BTreeMap<String, FileRecord> =
                    index.list_files("").await.unwrap().into_iter().collect();
                assert_eq!(files, model);
            });
        }
    }
}
