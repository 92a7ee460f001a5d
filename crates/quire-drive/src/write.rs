use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use quire_log::Feed;
use quire_types::{path, FileRecord, DEFAULT_FILE_MODE, S_IFREG};

use crate::drive::Drive;
use crate::error::{DriveError, DriveResult};

/// Metadata for a written file. Unset fields take defaults at commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Permission bits; the regular-file type bit is always added.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
}

/// The content blocks appended by one write stream.
///
/// Only a write stream can measure one, so a file record built from it
/// always refers to content that is already in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendedSpan {
    blocks: u64,
    size: u64,
    head_length: u64,
    head_byte_length: u64,
}

impl AppendedSpan {
    fn measure(content: &Feed, baseline: Baseline) -> Self {
        let head_length = content.len();
        let head_byte_length = content.byte_len();
        Self {
            blocks: head_length - baseline.length,
            size: head_byte_length - baseline.byte_length,
            head_length,
            head_byte_length,
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Build the file record committing this span.
    pub fn into_record(self, options: &WriteOptions) -> FileRecord {
        let now = now_millis();
        FileRecord {
            mode: options.mode.unwrap_or(DEFAULT_FILE_MODE) | S_IFREG,
            size: self.size,
            blocks: self.blocks,
            uid: options.uid.unwrap_or(0),
            gid: options.gid.unwrap_or(0),
            mtime: options.mtime.unwrap_or(now),
            ctime: options.ctime.unwrap_or(now),
            head_length: self.head_length,
            head_byte_length: self.head_byte_length,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Baseline {
    length: u64,
    byte_length: u64,
}

/// Appends file content to the drive and commits its record on
/// [`finish`](WriteStream::finish).
///
/// Holds the drive's write lock until finished or dropped. Dropping without
/// finishing leaves the appended blocks unreferenced.
pub struct WriteStream {
    drive: Drive,
    path: String,
    options: WriteOptions,
    content: Feed,
    baseline: Baseline,
    block_size: usize,
    _guard: OwnedMutexGuard<()>,
}

impl Drive {
    /// Open a write stream for `path`.
    pub async fn create_write_stream(
        &self,
        path: &str,
        options: WriteOptions,
    ) -> DriveResult<WriteStream> {
        self.check_writable()?;
        let path = path::normalize(path);
        if path.is_empty() {
            return Err(DriveError::InvalidPath(path));
        }
        let content = self.ensure_content().await?;
        if !content.writable() {
            return Err(DriveError::NotWritable);
        }

        let guard = std::sync::Arc::clone(&self.inner.write_lock).lock_owned().await;
        let baseline = Baseline {
            length: content.len(),
            byte_length: content.byte_len(),
        };
        debug!(path = %path, length = baseline.length, "write stream opened");
        Ok(WriteStream {
            drive: self.clone(),
            path,
            options,
            content,
            baseline,
            block_size: self.inner.config.block_size,
            _guard: guard,
        })
    }

    /// Write `data` to `path` in one go. Returns the committed record.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        options: WriteOptions,
    ) -> DriveResult<FileRecord> {
        let mut stream = self.create_write_stream(path, options).await?;
        stream.write(data.as_ref())?;
        stream.finish().await
    }
}

impl WriteStream {
    /// Append `data`, split into blocks of at most the configured block
    /// size. Empty input appends nothing.
    pub fn write(&mut self, data: &[u8]) -> DriveResult<()> {
        for piece in data.chunks(self.block_size) {
            self.content.append(Bytes::copy_from_slice(piece))?;
        }
        Ok(())
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.content.byte_len() - self.baseline.byte_length
    }

    /// Commit the file record. Returns only after the commit succeeded.
    pub async fn finish(self) -> DriveResult<FileRecord> {
        let span = AppendedSpan::measure(&self.content, self.baseline);
        let record = span.into_record(&self.options);
        let version = self.drive.inner.tree.put(&self.path, record.clone()).await?;
        info!(
            path = %self.path,
            size = record.size,
            blocks = record.blocks,
            version,
            "file committed"
        );
        Ok(record)
    }
}

impl fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteStream")
            .field("path", &self.path)
            .field("written", &self.written())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use quire_log::MemoryProvider;
    use quire_types::S_IFMT;
    use std::sync::Arc;
    use std::time::Duration;

    fn drive(block_size: usize) -> Drive {
        Drive::new(
            Arc::new(MemoryProvider::new()),
            DriveConfig {
                block_size,
                ..DriveConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn record_addresses_appended_blocks() {
        let drive = drive(4);
        drive.write_file("first", b"12345", WriteOptions::default()).await.unwrap();
        let record = drive.write_file("second", b"abcdefghij", WriteOptions::default()).await.unwrap();

        assert_eq!(record.size, 10);
        assert_eq!(record.blocks, 3);
        assert_eq!(record.block_range(), 2..5);
        assert_eq!(record.byte_range(), 5..15);
        assert_eq!(record.mode & S_IFMT, S_IFREG);
        assert_eq!(record.permissions(), DEFAULT_FILE_MODE);
    }

    #[tokio::test]
    async fn chunks_are_split_at_block_size() {
        let drive = drive(65536);
        let mut stream = drive.create_write_stream("big", WriteOptions::default()).await.unwrap();
        stream.write(&vec![7u8; 65536 * 2 + 1]).unwrap();
        stream.write(b"").unwrap();
        stream.write(b"tail").unwrap();
        assert_eq!(stream.written(), 65536 * 2 + 5);
        let record = stream.finish().await.unwrap();
        assert_eq!(record.blocks, 4);
        assert_eq!(drive.read_file("big").await.unwrap().len(), 65536 * 2 + 5);
    }

    #[tokio::test]
    async fn options_are_recorded() {
        let drive = drive(16);
        let options = WriteOptions {
            mode: Some(0o600),
            uid: Some(1000),
            gid: Some(100),
            mtime: Some(42),
            ctime: Some(43),
        };
        drive.write_file("f", b"x", options).await.unwrap();
        let stat = drive.stat("f").await.unwrap();
        assert_eq!(stat.permissions(), 0o600);
        assert_eq!((stat.uid, stat.gid, stat.mtime, stat.ctime), (1000, 100, 42, 43));
    }

    #[tokio::test]
    async fn rewrite_leaves_earlier_version_intact() {
        let drive = drive(16);
        let old = drive.write_file("p1", b"first", WriteOptions::default()).await.unwrap();
        let version = drive.version();
        drive.write_file("p2", b"second", WriteOptions::default()).await.unwrap();
        drive.write_file("p1", b"rewritten", WriteOptions::default()).await.unwrap();

        assert_eq!(&drive.read_file("p1").await.unwrap()[..], b"rewritten");
        let snapshot = drive.checkout(version).unwrap();
        assert_eq!(snapshot.stat("p1").await.unwrap(), old);
        assert_eq!(&snapshot.read_file("p1").await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn writers_are_serialized() {
        let drive = drive(16);
        let first = drive.create_write_stream("a", WriteOptions::default()).await.unwrap();

        let other = drive.clone();
        let second = tokio::spawn(async move {
            other.write_file("b", b"second", WriteOptions::default()).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        let mut first = first;
        first.write(b"first").unwrap();
        first.finish().await.unwrap();
        second.await.unwrap();

        assert_eq!(&drive.read_file("a").await.unwrap()[..], b"first");
        assert_eq!(&drive.read_file("b").await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn abandoned_stream_commits_nothing() {
        let drive = drive(16);
        {
            let mut stream = drive.create_write_stream("lost", WriteOptions::default()).await.unwrap();
            stream.write(b"orphaned").unwrap();
        }
        assert!(matches!(drive.stat("lost").await, Err(DriveError::NotFound(_))));
        assert_eq!(drive.content_feed().unwrap().len(), 1);
        // the lock was released
        drive.write_file("next", b"ok", WriteOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn empty_path_rejected() {
        let drive = drive(16);
        assert!(matches!(
            drive.write_file("/", b"x", WriteOptions::default()).await,
            Err(DriveError::InvalidPath(_))
        ));
    }
}
