//! Byte-range read streams.
//!
//! A read stream maps the requested byte range of a file onto its block
//! range in the content feed, reserves those blocks for download, and emits
//! one chunk per block, trimmed at both ends.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quire_log::{Feed, Reservation};
use quire_types::path;

use crate::drive::Drive;
use crate::error::{DriveError, DriveResult};

/// Byte range to read. `end` is exclusive and takes precedence over
/// `length`; with neither, the stream runs to the end of the file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    pub start: u64,
    pub end: Option<u64>,
    pub length: Option<u64>,
}

impl ReadOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            length: None,
        }
    }

    /// Requested byte count, if bounded.
    fn requested_length(&self) -> Option<u64> {
        match (self.end, self.length) {
            (Some(end), _) => Some(end.saturating_sub(self.start)),
            (None, length) => length,
        }
    }
}

/// A lazy, forward-only stream of file chunks.
///
/// Dropping the stream releases its download reservation.
pub struct ReadStream {
    inner: BoxStream<'static, DriveResult<Bytes>>,
}

impl Stream for ReadStream {
    type Item = DriveResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream").finish_non_exhaustive()
    }
}

enum ReadState {
    Setup {
        drive: Drive,
        path: String,
        options: ReadOptions,
    },
    Reading(Cursor),
    Done,
}

struct Cursor {
    content: Feed,
    index: u64,
    end: u64,
    /// Bytes to trim from the front of the next chunk.
    offset: u64,
    remaining: Option<u64>,
    reservation: Reservation,
}

impl Drive {
    /// Stream the bytes of `path` within the range given by `options`.
    pub fn create_read_stream(&self, path: &str, options: ReadOptions) -> ReadStream {
        let state = ReadState::Setup {
            drive: self.clone(),
            path: path::normalize(path),
            options,
        };
        let inner = stream::unfold(state, |state| async move {
            match state {
                ReadState::Setup {
                    drive,
                    path,
                    options,
                } => match open_cursor(&drive, &path, &options).await {
                    Ok(Some(cursor)) => next_chunk(cursor).await,
                    Ok(None) => None,
                    Err(e) => Some((Err(e), ReadState::Done)),
                },
                ReadState::Reading(cursor) => next_chunk(cursor).await,
                ReadState::Done => None,
            }
        })
        .boxed();
        ReadStream { inner }
    }

    /// Read the whole file at `path`.
    pub async fn read_file(&self, path: &str) -> DriveResult<Bytes> {
        let chunks: Vec<Bytes> = self
            .create_read_stream(path, ReadOptions::default())
            .try_collect()
            .await?;
        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap_or_default());
        }
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Resolve the file record and position the cursor. `Ok(None)` means the
/// requested range is empty.
async fn open_cursor(
    drive: &Drive,
    path: &str,
    options: &ReadOptions,
) -> DriveResult<Option<Cursor>> {
    let content = drive.ensure_content().await?;
    let record = drive
        .inner
        .tree
        .get(path)
        .await?
        .ok_or_else(|| DriveError::NotFound(path.to_string()))?;

    let start = options.start;
    if start >= record.size {
        return Ok(None);
    }
    let remaining = options
        .requested_length()
        .map(|length| length.min(record.size - start));
    if remaining == Some(0) {
        return Ok(None);
    }

    let blocks = record.block_range();
    let byte_offset = record.byte_range().start;
    let (index, offset) = if start > 0 {
        content.seek(byte_offset + start, blocks.clone()).await?
    } else {
        (blocks.start, 0)
    };

    let mut reservation = content.download(index..blocks.end, true);
    let mut end = blocks.end;
    if let Some(length) = remaining {
        let (last, intra) = content
            .seek(byte_offset + start + length, index..blocks.end)
            .await?;
        end = if intra > 0 { last + 1 } else { last };
        let tighter = content.download(index..end, true);
        std::mem::replace(&mut reservation, tighter).release();
    }

    debug!(path, start, index, offset, end, "read stream opened");
    Ok(Some(Cursor {
        content,
        index,
        end,
        offset,
        remaining,
        reservation,
    }))
}

async fn next_chunk(mut cursor: Cursor) -> Option<(DriveResult<Bytes>, ReadState)> {
    if cursor.index >= cursor.end || cursor.remaining == Some(0) {
        cursor.reservation.release();
        return None;
    }
    let mut data = match cursor.content.get(cursor.index).await {
        Ok(data) => data,
        Err(e) => return Some((Err(e.into()), ReadState::Done)),
    };
    cursor.index += 1;

    if cursor.offset > 0 {
        let offset = (cursor.offset as usize).min(data.len());
        data = data.slice(offset..);
        cursor.offset = 0;
    }
    if let Some(remaining) = cursor.remaining.as_mut() {
        if (data.len() as u64) > *remaining {
            data.truncate(*remaining as usize);
        }
        *remaining -= data.len() as u64;
    }
    Some((Ok(data), ReadState::Reading(cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::write::WriteOptions;
    use proptest::prelude::*;
    use quire_log::MemoryProvider;
    use std::sync::Arc;

    fn drive_with_blocks(block_size: usize) -> Drive {
        Drive::new(
            Arc::new(MemoryProvider::new()),
            DriveConfig {
                block_size,
                ..DriveConfig::default()
            },
        )
        .unwrap()
    }

    async fn read_range(drive: &Drive, path: &str, options: ReadOptions) -> Vec<u8> {
        let chunks: Vec<Bytes> = drive
            .create_read_stream(path, options)
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn hello_world() {
        let drive = drive_with_blocks(65536);
        drive.write_file("hello", b"world", WriteOptions::default()).await.unwrap();

        let stat = drive.stat("hello").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.blocks, 1);

        let part = read_range(
            &drive,
            "hello",
            ReadOptions {
                start: 1,
                length: Some(3),
                ..ReadOptions::default()
            },
        )
        .await;
        assert_eq!(part, b"orl");
    }

    #[tokio::test]
    async fn end_wins_over_length() {
        let drive = drive_with_blocks(4);
        drive.write_file("f", b"0123456789", WriteOptions::default()).await.unwrap();
        let options = ReadOptions {
            start: 2,
            end: Some(7),
            length: Some(1),
        };
        assert_eq!(read_range(&drive, "f", options).await, b"23456");
    }

    #[tokio::test]
    async fn ranges_across_block_boundaries() {
        let drive = drive_with_blocks(4);
        drive.write_file("f", b"abcdefghijklmn", WriteOptions::default()).await.unwrap();
        assert_eq!(drive.stat("f").await.unwrap().blocks, 4);

        assert_eq!(read_range(&drive, "f", ReadOptions::range(3, 9)).await, b"defghi");
        assert_eq!(read_range(&drive, "f", ReadOptions::range(4, 8)).await, b"efgh");
        assert_eq!(read_range(&drive, "f", ReadOptions::range(13, 14)).await, b"n");
        assert_eq!(
            read_range(
                &drive,
                "f",
                ReadOptions {
                    start: 6,
                    ..ReadOptions::default()
                }
            )
            .await,
            b"ghijklmn"
        );
    }

    #[tokio::test]
    async fn empty_and_out_of_range_reads() {
        let drive = drive_with_blocks(4);
        drive.write_file("f", b"abc", WriteOptions::default()).await.unwrap();
        drive.write_file("empty", b"", WriteOptions::default()).await.unwrap();

        assert!(read_range(&drive, "f", ReadOptions::range(1, 1)).await.is_empty());
        assert!(read_range(
            &drive,
            "f",
            ReadOptions {
                start: 3,
                ..ReadOptions::default()
            }
        )
        .await
        .is_empty());
        assert!(drive.read_file("empty").await.unwrap().is_empty());
        assert_eq!(read_range(&drive, "f", ReadOptions::range(1, 100)).await, b"bc");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let drive = drive_with_blocks(4);
        let err = drive.read_file("nope").await.unwrap_err();
        assert!(matches!(err, DriveError::NotFound(path) if path == "nope"));
    }

    #[tokio::test]
    async fn file_neighbours_are_not_read() {
        let drive = drive_with_blocks(3);
        drive.write_file("a", b"aaaaaaa", WriteOptions::default()).await.unwrap();
        drive.write_file("b", b"bbbbb", WriteOptions::default()).await.unwrap();
        drive.write_file("c", b"ccc", WriteOptions::default()).await.unwrap();
        assert_eq!(&drive.read_file("b").await.unwrap()[..], b"bbbbb");
        assert_eq!(read_range(&drive, "b", ReadOptions::range(1, 4)).await, b"bbb");
    }

    #[tokio::test]
    async fn reservations_released_on_end_and_drop() {
        let drive = drive_with_blocks(2);
        drive.write_file("f", b"0123456789", WriteOptions::default()).await.unwrap();
        let content = drive.content_feed().unwrap();

        read_range(&drive, "f", ReadOptions::default()).await;
        read_range(&drive, "f", ReadOptions::range(3, 5)).await;
        let stats = content.reservation_stats();
        assert_eq!(stats.active, 0);
        // the bounded read held a wide and a tight reservation
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);

        let mut stream = drive.create_read_stream("f", ReadOptions::default());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"01");
        assert_eq!(content.reservation_stats().active, 1);
        drop(stream);
        let stats = content.reservation_stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.acquired, stats.released);
    }

    #[tokio::test]
    async fn unpolled_stream_holds_nothing() {
        let drive = drive_with_blocks(2);
        drive.write_file("f", b"0123", WriteOptions::default()).await.unwrap();
        let content = drive.content_feed().unwrap();
        let stream = drive.create_read_stream("f", ReadOptions::default());
        drop(stream);
        assert_eq!(content.reservation_stats().acquired, 0);
    }

    proptest! {
        #[test]
        fn range_reads_match_slices(
            data in proptest::collection::vec(any::<u8>(), 0..200),
            block_size in 1usize..17,
            a in 0usize..220,
            b in 0usize..220,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let drive = drive_with_blocks(block_size);
                drive.write_file("p", &data, WriteOptions::default()).await.unwrap();
                assert_eq!(&drive.read_file("p").await.unwrap()[..], &data[..]);

                let start = a.min(b).min(data.len());
                let end = a.max(b).min(data.len());
                let slice = read_range(&drive, "p", ReadOptions::range(start as u64, end as u64)).await;
                assert_eq!(&slice[..], &data[start..end]);

                let by_length = read_range(
                    &drive,
                    "p",
                    ReadOptions {
                        start: start as u64,
                        end: None,
                        length: Some((end - start) as u64),
                    },
                )
                .await;
                assert_eq!(&by_length[..], &data[start..end]);
            });
        }
    }
}
