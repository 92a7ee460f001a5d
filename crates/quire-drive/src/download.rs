//! Per-file download statistics and explicit downloads for sparse drives.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use quire_log::Feed;
use quire_types::{path, FileRecord};

use crate::drive::Drive;
use crate::error::{DriveError, DriveResult};

/// Block counts for one file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub blocks: u64,
    pub downloaded_blocks: u64,
}

impl FileStats {
    pub fn is_complete(&self) -> bool {
        self.downloaded_blocks == self.blocks
    }
}

/// Result of [`Drive::stats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stats {
    File(FileStats),
    /// Every file below a directory, keyed by path.
    Directory(BTreeMap<String, FileStats>),
}

impl Stats {
    /// Sum over all files.
    pub fn total(&self) -> FileStats {
        match self {
            Self::File(stats) => *stats,
            Self::Directory(files) => files.values().fold(FileStats::default(), |acc, s| FileStats {
                blocks: acc.blocks + s.blocks,
                downloaded_blocks: acc.downloaded_blocks + s.downloaded_blocks,
            }),
        }
    }

    pub fn get(&self, path: &str) -> Option<FileStats> {
        match self {
            Self::File(stats) => Some(*stats),
            Self::Directory(files) => files.get(&path::normalize(path)).copied(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Files fetched at the same time.
    pub max_concurrent: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// What a finished download fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub files: usize,
    pub blocks: u64,
}

/// A running download started by [`Drive::download`].
///
/// Dropping the handle lets the download run to completion in the
/// background.
#[derive(Debug)]
pub struct DownloadHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<DriveResult<DownloadSummary>>,
}

impl DownloadHandle {
    /// Stop the download and release its reservations. Blocks already
    /// fetched stay local.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the download. Fails with [`DriveError::Cancelled`] if it was
    /// cancelled first.
    pub async fn finished(self) -> DriveResult<DownloadSummary> {
        self.task
            .await
            .map_err(|e| DriveError::Internal(format!("download task failed: {e}")))?
    }
}

impl Drive {
    /// Block statistics for the file at `path`, or for every file below it.
    pub async fn stats(&self, path: &str) -> DriveResult<Stats> {
        let content = self.ensure_content().await?;
        if let Some(record) = self.inner.tree.get(path).await? {
            return Ok(Stats::File(file_stats(&content, &record)));
        }
        let files = self.inner.tree.list_files(path).await?;
        if files.is_empty() {
            return Err(DriveError::NotFound(path.to_string()));
        }
        Ok(Stats::Directory(
            files
                .into_iter()
                .map(|(file, record)| (file, file_stats(&content, &record)))
                .collect(),
        ))
    }

    /// Fetch every block of the file at `path`, or of every file below it.
    pub async fn download(&self, path: &str, options: DownloadOptions) -> DriveResult<DownloadHandle> {
        let content = self.ensure_content().await?;
        let files = match self.inner.tree.get(path).await? {
            Some(record) => vec![(path::normalize(path), record)],
            None => self.inner.tree.list_files(path).await?,
        };
        if files.is_empty() {
            return Err(DriveError::NotFound(path.to_string()));
        }

        let (cancel, cancelled) = watch::channel(false);
        let max_concurrent = options.max_concurrent.max(1);
        info!(path, files = files.len(), max_concurrent, "download started");
        let task = tokio::spawn(async move {
            let fetches = stream::iter(files)
                .map(|(file, record)| fetch_file(content.clone(), file, record))
                .buffer_unordered(max_concurrent)
                .fold(DownloadSummary::default(), |summary, blocks| async move {
                    DownloadSummary {
                        files: summary.files + 1,
                        blocks: summary.blocks + blocks,
                    }
                });
            tokio::select! {
                summary = fetches => {
                    info!(files = summary.files, blocks = summary.blocks, "download finished");
                    Ok(summary)
                }
                _ = wait_cancelled(cancelled) => {
                    info!("download cancelled");
                    Err(DriveError::Cancelled)
                }
            }
        });
        Ok(DownloadHandle { cancel, task })
    }
}

fn file_stats(content: &Feed, record: &FileRecord) -> FileStats {
    FileStats {
        blocks: record.blocks,
        downloaded_blocks: content.downloaded(record.block_range()),
    }
}

async fn fetch_file(content: Feed, file: String, record: FileRecord) -> u64 {
    let range = record.block_range();
    let reservation = content.download(range.clone(), false);
    content.wait_for_range(range).await;
    reservation.release();
    debug!(path = %file, blocks = record.blocks, "file downloaded");
    record.blocks
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow_and_update() {
            return;
        }
        if cancelled.changed().await.is_err() {
            // handle dropped without cancelling
            std::future::pending::<()>().await;
        }
    }
}
