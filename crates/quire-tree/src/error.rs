//! Error types for the path index.

use quire_log::LogError;

/// Errors that can occur during path index operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// Mutation attempted through a pinned (checked-out) index.
    #[error("index is pinned at version {0} and cannot be modified")]
    Pinned(u64),

    /// Checkout requested beyond the current version.
    #[error("version {requested} is beyond the current version {current}")]
    InvalidVersion { requested: u64, current: u64 },

    /// The metadata feed has no index record yet.
    #[error("metadata feed is not initialized")]
    Uninitialized,

    /// An invalid path was provided.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// A tree node could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Feed operation failed.
    #[error("log error: {0}")]
    Log(#[from] LogError),
}

/// Convenience alias for path index results.
pub type TreeResult<T> = Result<T, TreeError>;
