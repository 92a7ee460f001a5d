//! Append-only block feeds for Quire.
//!
//! A [`Feed`] is an append-only sequence of immutable blocks. Every block is
//! addressed by its index and verified by its BLAKE3 [`BlockId`]. Feeds may
//! be sparse: they know the size and id of every block up to their length
//! but hold only the blocks that were appended locally, read, or reserved
//! with [`Feed::download`].
//!
//! # Components
//!
//! - [`Feed`]: append, get, byte-offset seek, waits and download reservations
//! - [`BlockStorage`]: persistence backend ([`MemoryStorage`], [`FileStorage`])
//! - [`StorageProvider`]: per-feed storage by name ([`MemoryProvider`],
//!   [`DirectoryProvider`])
//! - [`Replication`]: a live stream replicating any number of feeds with a peer
//!
//! [`BlockId`]: quire_types::BlockId

pub mod error;
pub mod feed;
pub mod file;
pub mod memory;
pub mod protocol;
pub mod replicate;
pub mod reservation;
pub mod storage;

pub use error::{LogError, LogResult};
pub use feed::{Feed, FeedOptions};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use protocol::{FeedMessage, Frame, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use replicate::{ProtocolOptions, Replication, Status};
pub use reservation::{Reservation, ReservationStats};
pub use storage::{BlockStorage, DirectoryProvider, MemoryProvider, StorageProvider, StoredFeed};
