use quire_log::LogError;
use quire_tree::TreeError;
use quire_types::TypeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    /// Neither a file nor a directory prefix.
    #[error("{0} could not be found")]
    NotFound(String),

    /// The metadata feed already holds an index record.
    #[error("index already written")]
    AlreadyInitialized,

    /// Write attempted on a checkout.
    #[error("cannot write to a checkout")]
    ReadOnlyViolation,

    /// Write attempted on a drive we hold no secret for.
    #[error("drive is not writable")]
    NotWritable,

    #[error("version {requested} is beyond the current version {current}")]
    InvalidVersion { requested: u64, current: u64 },

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// A download was cancelled before it finished.
    #[error("download cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("tree error: {0}")]
    Tree(TreeError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TreeError> for DriveError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::InvalidVersion { requested, current } => {
                Self::InvalidVersion { requested, current }
            }
            TreeError::Pinned(_) => Self::ReadOnlyViolation,
            TreeError::InvalidPath(path) => Self::InvalidPath(path),
            other => Self::Tree(other),
        }
    }
}

pub type DriveResult<T> = Result<T, DriveError>;
