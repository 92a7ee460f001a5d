use std::fmt;
use std::sync::{Arc, Weak};

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use quire_log::{Feed, FeedOptions, LogError, StorageProvider};
use quire_tree::{HistoryEntry, HistoryOptions, PathIndex};
use quire_types::{path, DiscoveryKey, FeedKey, FileRecord, IndexRecord};

use crate::config::DriveConfig;
use crate::error::{DriveError, DriveResult};

pub(crate) const METADATA_FEED: &str = "metadata";
pub(crate) const CONTENT_FEED: &str = "content";

/// A versioned filesystem over a metadata feed and a content feed.
///
/// Entry 0 of the metadata feed is the [`IndexRecord`] naming the content
/// feed; later entries are path index nodes. `Drive` is a cheap handle;
/// clones share the same feeds, readiness and write lock.
#[derive(Clone)]
pub struct Drive {
    pub(crate) inner: Arc<DriveInner>,
}

pub(crate) struct DriveInner {
    pub(crate) metadata: Feed,
    pub(crate) tree: PathIndex,
    content: OnceCell<Feed>,
    ready: OnceCell<()>,
    /// Root drive of a checkout. Content always resolves through it.
    origin: Option<Drive>,
    pub(crate) write_lock: Arc<Mutex<()>>,
    provider: Arc<dyn StorageProvider>,
    pub(crate) config: DriveConfig,
    /// Deferred content attachment of a replica, aborted with the drive.
    attach_task: std::sync::Mutex<Option<AbortOnDrop>>,
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Drive {
    /// Create a new writable drive, or reopen the one held by `provider`.
    pub fn new(provider: Arc<dyn StorageProvider>, config: DriveConfig) -> DriveResult<Self> {
        config.validate()?;
        let storage = provider.feed_storage(METADATA_FEED)?;
        let metadata = Feed::create(storage, feed_options(&config))?;
        Ok(Self::from_metadata(provider, metadata, config))
    }

    /// Open the drive identified by `key`, typically as a replica.
    pub fn with_key(
        provider: Arc<dyn StorageProvider>,
        key: FeedKey,
        config: DriveConfig,
    ) -> DriveResult<Self> {
        config.validate()?;
        let storage = provider.feed_storage(METADATA_FEED)?;
        let metadata = Feed::open(storage, key, feed_options(&config))?;
        Ok(Self::from_metadata(provider, metadata, config))
    }

    fn from_metadata(
        provider: Arc<dyn StorageProvider>,
        metadata: Feed,
        config: DriveConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DriveInner {
                tree: PathIndex::new(metadata.clone()),
                metadata,
                content: OnceCell::new(),
                ready: OnceCell::new(),
                origin: None,
                write_lock: Arc::new(Mutex::new(())),
                provider,
                config,
                attach_task: std::sync::Mutex::new(None),
            }),
        }
    }

    // ---- Identity ----

    pub fn key(&self) -> FeedKey {
        self.inner.metadata.key()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.metadata.discovery_key()
    }

    /// Current version: the metadata feed length, or the pinned version of
    /// a checkout.
    pub fn version(&self) -> u64 {
        self.inner.tree.version()
    }

    pub fn is_checkout(&self) -> bool {
        self.inner.origin.is_some()
    }

    /// Returns `true` if writes are allowed on this handle.
    pub fn writable(&self) -> bool {
        !self.is_checkout() && self.inner.metadata.writable()
    }

    pub fn config(&self) -> &DriveConfig {
        &self.inner.config
    }

    pub fn metadata(&self) -> &Feed {
        &self.inner.metadata
    }

    /// The content feed, if it has been attached yet.
    pub fn content_feed(&self) -> Option<Feed> {
        self.root().inner.content.get().cloned()
    }

    fn root(&self) -> &Drive {
        self.inner.origin.as_ref().unwrap_or(self)
    }

    // ---- Lifecycle ----

    /// Open the drive. Idempotent; concurrent callers share one execution.
    pub async fn ready(&self) -> DriveResult<()> {
        self.inner.ready.get_or_try_init(|| self.open()).await?;
        Ok(())
    }

    async fn open(&self) -> DriveResult<()> {
        if let Some(origin) = &self.inner.origin {
            // Attachment belongs to the root; a writable root writes entry 0.
            Box::pin(origin.ready()).await?;
            debug!(drive = %self.key().short_id(), version = self.version(), "checkout ready");
            return Ok(());
        }

        let metadata = &self.inner.metadata;
        if self.content_feed().is_some() {
            return Ok(());
        }

        if !self.writable() {
            if metadata.has(0) {
                self.content().await?;
            } else {
                self.spawn_attach();
            }
            debug!(drive = %self.key().short_id(), "read-only drive ready");
            return Ok(());
        }

        if metadata.has(0) {
            self.content().await?;
        } else {
            self.inner
                .content
                .get_or_try_init(|| self.initialize())
                .await?;
        }
        info!(drive = %self.key().short_id(), version = self.version(), "drive ready");
        Ok(())
    }

    /// Attach content once entry 0 replicates. The task only holds a weak
    /// handle and is aborted when the last drive handle drops.
    fn spawn_attach(&self) {
        let metadata = self.inner.metadata.clone();
        let weak: Weak<DriveInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            metadata.update(1).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let drive = Drive { inner };
            if let Err(e) = drive.content().await {
                warn!(drive = %drive.key().short_id(), error = %e, "content attachment failed");
            }
        });
        *self.inner.attach_task.lock().expect("attach task lock poisoned") =
            Some(AbortOnDrop(task.abort_handle()));
    }

    /// Create the content feed and write the index record as entry 0.
    async fn initialize(&self) -> DriveResult<Feed> {
        let storage = self.inner.provider.feed_storage(CONTENT_FEED)?;
        let content = Feed::create(storage, feed_options(&self.inner.config))?;
        let index = IndexRecord::new(content.key());
        match self.inner.metadata.compare_and_append(0, index.encode()?) {
            Ok(_) => {}
            Err(LogError::LengthMismatch { .. }) => return Err(DriveError::AlreadyInitialized),
            Err(e) => return Err(e.into()),
        }
        info!(
            drive = %self.key().short_id(),
            content = %content.key().short_id(),
            "index record written"
        );
        Ok(content)
    }

    /// Resolve the content feed from the index record, memoized.
    pub(crate) async fn content(&self) -> DriveResult<Feed> {
        let root = self.root();
        let content = root
            .inner
            .content
            .get_or_try_init(|| root.attach_content())
            .await?;
        Ok(content.clone())
    }

    async fn attach_content(&self) -> DriveResult<Feed> {
        let entry = self.inner.metadata.get(0).await?;
        let index = IndexRecord::decode(&entry)?;
        let storage = self.inner.provider.feed_storage(CONTENT_FEED)?;
        let content = Feed::open(storage, index.content, feed_options(&self.inner.config))?;
        info!(
            drive = %self.key().short_id(),
            content = %content.key().short_id(),
            writable = content.writable(),
            "content attached"
        );
        Ok(content)
    }

    /// Wait for readiness, then for the content feed.
    pub(crate) async fn ensure_content(&self) -> DriveResult<Feed> {
        self.ready().await?;
        self.content().await
    }

    /// Wait until the drive reaches at least `version`.
    pub async fn update(&self, version: u64) -> DriveResult<()> {
        self.ready().await?;
        if self.is_checkout() {
            let current = self.version();
            if version > current {
                return Err(DriveError::InvalidVersion {
                    requested: version,
                    current,
                });
            }
            return Ok(());
        }
        self.inner.metadata.update(version).await;
        Ok(())
    }

    // ---- Path operations ----

    /// Metadata for `path`. Paths with no record but with children are
    /// reported as directories.
    pub async fn stat(&self, path: &str) -> DriveResult<FileRecord> {
        self.ready().await?;
        if let Some(record) = self.inner.tree.get(path).await? {
            return Ok(record.into_regular());
        }
        if self.inner.tree.list(path).await?.is_empty() {
            return Err(DriveError::NotFound(path.to_string()));
        }
        Ok(FileRecord::directory())
    }

    /// Sorted names of the immediate children of `path`.
    pub async fn readdir(&self, path: &str) -> DriveResult<Vec<String>> {
        self.ready().await?;
        Ok(self.inner.tree.list(path).await?)
    }

    /// Succeeds if `path` is a file or a non-empty directory.
    pub async fn access(&self, path: &str) -> DriveResult<()> {
        self.stat(path).await.map(|_| ())
    }

    /// Remove `path` from the index. Its content blocks stay in the log.
    pub async fn unlink(&self, path: &str) -> DriveResult<()> {
        self.check_writable()?;
        self.ready().await?;
        let _guard = self.inner.write_lock.lock().await;
        if self.inner.tree.get(path).await?.is_none() {
            return Err(DriveError::NotFound(path.to_string()));
        }
        let version = self.inner.tree.del(path).await?;
        debug!(path = %path::normalize(path), version, "unlinked");
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> DriveResult<()> {
        if self.is_checkout() {
            return Err(DriveError::ReadOnlyViolation);
        }
        if !self.inner.metadata.writable() {
            return Err(DriveError::NotWritable);
        }
        Ok(())
    }

    // ---- Versions ----

    /// A read-only view of the drive at `version`.
    pub fn checkout(&self, version: u64) -> DriveResult<Drive> {
        let root = self.root().clone();
        let tree = self.inner.tree.checkout(version)?;
        debug!(drive = %self.key().short_id(), version, "checkout");
        Ok(Drive {
            inner: Arc::new(DriveInner {
                metadata: root.inner.metadata.clone(),
                tree,
                content: OnceCell::new(),
                ready: OnceCell::new(),
                write_lock: Arc::clone(&root.inner.write_lock),
                provider: Arc::clone(&root.inner.provider),
                config: root.inner.config.clone(),
                attach_task: std::sync::Mutex::new(None),
                origin: Some(root),
            }),
        })
    }

    /// The metadata change log. Lazy and finite; each call starts over.
    pub fn history(&self, options: HistoryOptions) -> BoxStream<'static, DriveResult<HistoryEntry>> {
        self.inner.tree.history(options).map_err(DriveError::from).boxed()
    }
}

pub(crate) fn feed_options(config: &DriveConfig) -> FeedOptions {
    FeedOptions {
        sparse: config.sparse,
    }
}

impl fmt::Debug for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drive")
            .field("key", &self.key())
            .field("version", &self.version())
            .field("writable", &self.writable())
            .field("checkout", &self.is_checkout())
            .field("content", &self.content_feed().map(|feed| feed.key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_log::{DirectoryProvider, MemoryProvider};

    fn drive() -> Drive {
        Drive::new(Arc::new(MemoryProvider::new()), DriveConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn ready_writes_index_record_once() {
        let drive = drive();
        let (a, b) = tokio::join!(drive.ready(), drive.ready());
        a.unwrap();
        b.unwrap();
        drive.ready().await.unwrap();

        assert_eq!(drive.metadata().len(), 1);
        assert_eq!(drive.version(), 1);
        let index = IndexRecord::decode(&drive.metadata().get(0).await.unwrap()).unwrap();
        assert_eq!(Some(index.content), drive.content_feed().map(|f| f.key()));
    }

    #[tokio::test]
    async fn second_index_record_is_rejected() {
        let drive = drive();
        drive.ready().await.unwrap();
        let err = drive.initialize().await.unwrap_err();
        assert!(matches!(err, DriveError::AlreadyInitialized));
        assert_eq!(drive.metadata().len(), 1);
    }

    #[tokio::test]
    async fn reopen_attaches_existing_content() {
        let provider: Arc<dyn StorageProvider> = Arc::new(MemoryProvider::new());
        let first = Drive::new(Arc::clone(&provider), DriveConfig::default()).unwrap();
        first.write_file("hello", b"world", Default::default()).await.unwrap();
        let key = first.key();
        let content = first.content_feed().unwrap().key();
        drop(first);

        let reopened = Drive::new(provider, DriveConfig::default()).unwrap();
        assert_eq!(reopened.key(), key);
        assert_eq!(&reopened.read_file("hello").await.unwrap()[..], b"world");
        assert_eq!(reopened.content_feed().unwrap().key(), content);
        assert!(reopened.writable());
    }

    #[tokio::test]
    async fn directory_drive_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let drive = Drive::new(
                Arc::new(DirectoryProvider::new(dir.path())),
                DriveConfig::default(),
            )
            .unwrap();
            drive.write_file("a/b.txt", b"on disk", Default::default()).await.unwrap();
        }
        let drive = Drive::new(
            Arc::new(DirectoryProvider::new(dir.path())),
            DriveConfig::default(),
        )
        .unwrap();
        assert_eq!(&drive.read_file("/a/b.txt").await.unwrap()[..], b"on disk");
        assert_eq!(drive.version(), 2);
    }

    #[tokio::test]
    async fn stat_file_and_synthesized_directory() {
        let drive = drive();
        for name in ["a/1", "a/2", "a/3"] {
            drive.write_file(name, name.as_bytes(), Default::default()).await.unwrap();
        }
        assert_eq!(drive.readdir("a").await.unwrap(), vec!["1", "2", "3"]);

        let dir = drive.stat("a").await.unwrap();
        assert!(dir.is_directory());
        assert_eq!(dir.size, 0);

        let file = drive.stat("/a/2").await.unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 3);

        assert!(matches!(drive.stat("b").await, Err(DriveError::NotFound(_))));
        drive.access("a").await.unwrap();
        drive.access("a/1").await.unwrap();
        assert!(matches!(drive.access("nope").await, Err(DriveError::NotFound(_))));
    }

    #[tokio::test]
    async fn unlink_removes_path_only() {
        let drive = drive();
        drive.write_file("a/1", b"one", Default::default()).await.unwrap();
        drive.write_file("a/2", b"two", Default::default()).await.unwrap();
        let content_len = drive.content_feed().unwrap().len();

        drive.unlink("a/1").await.unwrap();
        assert_eq!(drive.readdir("a").await.unwrap(), vec!["2"]);
        assert!(matches!(drive.stat("a/1").await, Err(DriveError::NotFound(_))));
        assert_eq!(drive.content_feed().unwrap().len(), content_len);
        assert!(matches!(drive.unlink("a/1").await, Err(DriveError::NotFound(_))));
    }

    #[tokio::test]
    async fn checkout_isolation() {
        let drive = drive();
        drive.write_file("a/1", b"1", Default::default()).await.unwrap();
        drive.write_file("a/2", b"2", Default::default()).await.unwrap();
        let version = drive.version();
        let snapshot = drive.checkout(version).unwrap();
        drive.write_file("a/3", b"3", Default::default()).await.unwrap();

        assert_eq!(snapshot.version(), version);
        assert_eq!(snapshot.readdir("a").await.unwrap(), vec!["1", "2"]);
        assert_eq!(&snapshot.read_file("a/2").await.unwrap()[..], b"2");
        assert!(matches!(snapshot.stat("a/3").await, Err(DriveError::NotFound(_))));
        assert_eq!(drive.readdir("a").await.unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn checkout_is_read_only_and_shares_content() {
        let drive = drive();
        drive.write_file("f", b"data", Default::default()).await.unwrap();
        let snapshot = drive.checkout(drive.version()).unwrap();
        let nested = snapshot.checkout(1).unwrap();

        assert!(!snapshot.writable());
        assert!(matches!(
            snapshot.write_file("g", b"x", Default::default()).await,
            Err(DriveError::ReadOnlyViolation)
        ));
        assert!(matches!(snapshot.unlink("f").await, Err(DriveError::ReadOnlyViolation)));

        snapshot.ready().await.unwrap();
        assert!(snapshot
            .content_feed()
            .unwrap()
            .same_feed(&drive.content_feed().unwrap()));
        assert!(nested.readdir("").await.unwrap().is_empty());
        assert_eq!(nested.version(), 1);
    }

    #[tokio::test]
    async fn early_checkout_leaves_origin_able_to_initialize() {
        let drive = drive();
        let snapshot = drive.checkout(0).unwrap();
        snapshot.ready().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), drive.ready())
            .await
            .expect("origin stuck after checkout")
            .unwrap();
        assert!(drive.metadata().has(0));
        assert!(snapshot
            .content_feed()
            .unwrap()
            .same_feed(&drive.content_feed().unwrap()));
        assert!(matches!(snapshot.stat("f").await, Err(DriveError::NotFound(_))));
    }

    #[tokio::test]
    async fn checkout_beyond_head_fails() {
        let drive = drive();
        drive.ready().await.unwrap();
        assert!(matches!(
            drive.checkout(9),
            Err(DriveError::InvalidVersion {
                requested: 9,
                current: 1
            })
        ));
    }

    #[tokio::test]
    async fn history_lists_changes() {
        let drive = drive();
        drive.write_file("x", b"1", Default::default()).await.unwrap();
        drive.write_file("y", b"2", Default::default()).await.unwrap();
        drive.unlink("x").await.unwrap();

        let entries: Vec<HistoryEntry> = drive
            .history(HistoryOptions::default())
            .try_collect()
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["x", "y", "x"]);
        assert_eq!(entries.last().unwrap().version(), drive.version());
    }

    #[tokio::test]
    async fn replica_without_index_is_ready_but_not_writable() {
        let origin = drive();
        let replica = Drive::with_key(
            Arc::new(MemoryProvider::new()),
            origin.key(),
            DriveConfig::default(),
        )
        .unwrap();
        replica.ready().await.unwrap();
        assert!(replica.content_feed().is_none());
        assert_eq!(replica.version(), 0);
        assert!(matches!(
            replica.write_file("f", b"x", Default::default()).await,
            Err(DriveError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn pending_attachment_does_not_keep_replica_alive() {
        let origin = drive();
        let replica = Drive::with_key(
            Arc::new(MemoryProvider::new()),
            origin.key(),
            DriveConfig::default(),
        )
        .unwrap();
        replica.ready().await.unwrap();
        tokio::task::yield_now().await;

        let weak = Arc::downgrade(&replica.inner);
        drop(replica);
        assert!(weak.upgrade().is_none());
    }
}
