//! Versioned path index for Quire drives.
//!
//! A [`PathIndex`] maps drive paths to [`FileRecord`]s. Every put or delete
//! is a [`TreeNode`] appended to the drive's metadata feed, so the feed is
//! the tree's history and its length is the tree's version.
//!
//! # Key Types
//!
//! - [`PathIndex`]: get/put/del, child listing, checkout, history
//! - [`TreeNode`]: the encoding of one metadata entry
//! - [`HistoryEntry`] / [`Change`]: items of the change log
//!
//! [`FileRecord`]: quire_types::FileRecord

pub mod error;
pub mod index;
pub mod node;

pub use error::{TreeError, TreeResult};
pub use index::{Change, HistoryEntry, HistoryOptions, PathIndex, DEFAULT_OFFSET};
pub use node::TreeNode;
