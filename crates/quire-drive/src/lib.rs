//! Quire drives: a versioned virtual filesystem over two append-only feeds.
//!
//! A [`Drive`] keeps file metadata in a metadata feed, whose entry 0 names
//! the content feed and whose later entries are path index nodes. File
//! bytes live in the content feed as blocks. Every file record addresses a
//! contiguous run of content blocks, so a drive can be read at any earlier
//! version and replicated sparsely, one file or one byte range at a time.
//!
//! # Components
//!
//! - [`Drive`]: lifecycle, stat/readdir/unlink, checkout and history
//! - [`ReadStream`] / [`WriteStream`]: streaming file content
//! - [`Drive::stats`] / [`Drive::download`]: sparse download control
//! - [`Drive::replicate`]: both feeds over one replication stream
//! - [`DriveConfig`]: TOML-loadable settings

pub mod config;
pub mod download;
pub mod drive;
pub mod error;
pub mod read;
pub mod replicate;
pub mod write;

pub use config::{DriveConfig, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
pub use download::{DownloadHandle, DownloadOptions, DownloadSummary, FileStats, Stats};
pub use drive::Drive;
pub use error::{DriveError, DriveResult};
pub use read::{ReadOptions, ReadStream};
pub use replicate::{ReplicateOptions, DRIVE_FEEDS};
pub use write::{AppendedSpan, WriteOptions, WriteStream};

pub use quire_log::{DirectoryProvider, MemoryProvider, Replication, StorageProvider};
pub use quire_tree::{Change, HistoryEntry, HistoryOptions};
pub use quire_types::{FeedKey, FileRecord};
