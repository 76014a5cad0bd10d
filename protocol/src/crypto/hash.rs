//! # Hashing Utilities
//!
//! Two hash functions, two jobs, and we refuse to add more without a very
//! good reason:
//!
//! - **BLAKE3** is the workhorse: content addressing of stored payloads and
//!   hashing of public keys. Fast on every platform that matters and a
//!   proper cryptographic hash.
//! - **SHA-256** is used only inside the hashcash proof-of-work, where we
//!   want the most widely understood cost function rather than the fastest
//!   one. A faster hash would only make spam cheaper.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Compute the SHA-256 hash of the input, as a fixed-size array.
///
/// Reserved for the proof-of-work path. For everything else, use
/// [`ContentHash::of`].
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// A 32-byte BLAKE3 digest identifying a piece of content on the overlay.
///
/// Storage maps are keyed by `ContentHash` of the serialized payload, so
/// identical data gossiped through different routes converges on a single
/// map entry. The same representation is used to hash public keys; see
/// [`KeyHash`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

/// The BLAKE3 hash of an Ed25519 public key.
///
/// Stored data carries key hashes rather than full keys; ownership checks
/// (who may remove an entry) are hash-equality checks against this value.
pub type KeyHash = ContentHash;

impl ContentHash {
    /// Hash arbitrary bytes with BLAKE3.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap an existing 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded digest, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes of hex is enough to eyeball log lines.
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}
