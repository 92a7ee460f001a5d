use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::key::FeedKey;

/// File type mask (`S_IFMT`).
pub const S_IFMT: u32 = 0o170_000;
/// Regular file type bit (`S_IFREG`).
pub const S_IFREG: u32 = 0o100_000;
/// Directory type bit (`S_IFDIR`).
pub const S_IFDIR: u32 = 0o040_000;
/// Default permission bits for files: `rw-r--r--`.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default permission bits for synthesized directories: `rwxr-xr-x`.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Kind tag written into every drive's index record.
pub const INDEX_KIND: &str = "quire";

/// Metadata committed to the path index for one file.
///
/// The file's blocks occupy content-log indices
/// `[head_length - blocks, head_length)` and its bytes occupy content-log byte
/// positions `[head_byte_length - size, head_byte_length)`. A record is never
/// mutated after commit; rewriting a path commits a new record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Number of content blocks.
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime: u64,
    /// Change time, milliseconds since the Unix epoch.
    pub ctime: u64,
    /// Content log length immediately after this file's blocks.
    pub head_length: u64,
    /// Content log byte length immediately after this file's blocks.
    pub head_byte_length: u64,
}

impl FileRecord {
    /// Synthetic record for a directory that exists only as a path prefix.
    pub fn directory() -> Self {
        Self {
            mode: S_IFDIR | DEFAULT_DIR_MODE,
            ..Self::default()
        }
    }

    /// Force the regular-file type bits, keeping the permission bits.
    pub fn into_regular(mut self) -> Self {
        self.mode = (self.mode & !S_IFMT) | S_IFREG;
        self
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Permission bits without the file type.
    pub fn permissions(&self) -> u32 {
        self.mode & !S_IFMT
    }

    /// Content-log block indices holding this file.
    pub fn block_range(&self) -> Range<u64> {
        self.head_length.saturating_sub(self.blocks)..self.head_length
    }

    /// Content-log byte positions holding this file.
    pub fn byte_range(&self) -> Range<u64> {
        self.head_byte_length.saturating_sub(self.size)..self.head_byte_length
    }
}

/// Entry 0 of every drive's metadata log: binds the drive to its content log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub kind: String,
    pub content: FeedKey,
}

impl IndexRecord {
    pub fn new(content: FeedKey) -> Self {
        Self {
            kind: INDEX_KIND.to_string(),
            content,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TypeError> {
        bincode::serialize(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Decode and check the kind tag.
    pub fn decode(data: &[u8]) -> Result<Self, TypeError> {
        let record: Self =
            bincode::deserialize(data).map_err(|e| TypeError::Serialization(e.to_string()))?;
        if record.kind != INDEX_KIND {
            return Err(TypeError::UnknownIndexKind(record.kind));
        }
        Ok(record)
    }
}
