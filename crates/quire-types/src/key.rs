use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Public identity of a feed (append-only log).
///
/// A `FeedKey` is derived from a 32-byte secret with BLAKE3 key derivation.
/// Anyone holding the key can open and replicate the feed; only the holder
/// of the secret may append to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey([u8; 32]);

/// Key used to find peers for a feed without revealing the feed key.
///
/// Replication sessions are addressed by discovery key on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

/// Key material persisted alongside a feed.
///
/// `secret` is present only for feeds created locally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: FeedKey,
    pub secret: Option<[u8; 32]>,
}

impl FeedKey {
    /// Derive the public key for a secret.
    pub fn derive(secret: &[u8; 32]) -> Self {
        Self(blake3::derive_key("quire 2024 feed public key", secret))
    }

    /// Create from raw bytes. Use [`KeyPair::generate`] for new feeds.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The discovery key for this feed.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, b"quire-discovery").as_bytes())
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        decode_32(s).map(Self)
    }
}

impl DiscoveryKey {
    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl KeyPair {
    /// Generate a fresh writable key pair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut secret);
        Self {
            public: FeedKey::derive(&secret),
            secret: Some(secret),
        }
    }

    /// Key material for a feed we can only read.
    pub fn public_only(public: FeedKey) -> Self {
        Self {
            public,
            secret: None,
        }
    }

    /// Returns `true` if the secret matches the public key.
    pub fn is_writable(&self) -> bool {
        self.secret
            .as_ref()
            .is_some_and(|secret| FeedKey::derive(secret) == self.public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl fmt::Debug for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedKey({})", self.short_id())
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.short_id())
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn decode_32(s: &str) -> Result<[u8; 32], TypeError> {
    let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(TypeError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
