use std::fmt;

use serde::{Deserialize, Serialize};

/// Content-addressed identifier for a single feed block (BLAKE3 of its bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Compute the id of a block payload.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Returns `true` if `data` hashes to this id.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short_hex())
    }
}

/// What a feed knows about a block it may not hold yet: its size and id.
///
/// Block infos are announced during replication so that a sparse replica can
/// map byte offsets to block indices without fetching the blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub size: u64,
    pub id: BlockId,
}

impl BlockInfo {
    pub fn of(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            id: BlockId::of(data),
        }
    }
}
