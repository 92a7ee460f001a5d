//! Foundation types for Quire drives.
//!
//! Every other Quire crate depends on `quire-types`.
//!
//! # Key Types
//!
//! - [`FeedKey`] / [`DiscoveryKey`]: identity of an append-only feed
//! - [`KeyPair`]: persisted key material; the secret marks a writable feed
//! - [`BlockId`] / [`BlockInfo`]: content address and size of a feed block
//! - [`FileRecord`]: metadata committed for a path, addressing its content
//! - [`IndexRecord`]: entry 0 of a metadata feed, naming the content feed

pub mod block;
pub mod error;
pub mod key;
pub mod path;
pub mod record;

pub use block::{BlockId, BlockInfo};
pub use error::TypeError;
pub use key::{DiscoveryKey, FeedKey, KeyPair};
pub use record::{
    FileRecord, IndexRecord, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, INDEX_KIND, S_IFDIR, S_IFMT,
    S_IFREG,
};
