use std::io;

use quire_types::{FeedKey, TypeError};

/// Errors from feed, storage, and replication operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Append attempted on a feed we do not hold the secret for.
    #[error("feed {0:?} is not writable")]
    NotWritable(FeedKey),

    /// Compare-and-append found a different length than expected.
    #[error("feed length is {actual}, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Block index beyond the known length of the feed.
    #[error("block {index} out of range (length {length})")]
    OutOfRange { index: u64, length: u64 },

    /// Byte offset outside the byte span of the searched block range.
    #[error("byte offset {offset} outside [{start}, {end})")]
    SeekOutOfRange { offset: u64, start: u64, end: u64 },

    /// Received block data does not match the announced block id.
    #[error("block {index} failed verification")]
    BlockMismatch { index: u64 },

    /// A peer announced block infos conflicting with what we already hold.
    #[error("conflicting block info at index {index}")]
    ConflictingInfo { index: u64 },

    /// Stored key material belongs to a different feed.
    #[error("storage holds feed {stored:?}, expected {expected:?}")]
    KeyMismatch { stored: FeedKey, expected: FeedKey },

    /// A storage frame is malformed beyond recovery.
    #[error("corrupt storage at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wire protocol violation by the remote peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The replication stream was torn down with an error.
    #[error("replication failed: {0}")]
    Replication(String),

    /// The replication stream is already closed.
    #[error("replication stream closed")]
    Closed,

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for feed operations.
pub type LogResult<T> = Result<T, LogError>;
