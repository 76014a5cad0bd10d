//! # Cryptographic Primitives for VEIL
//!
//! Everything security-related flows through here: identity keys, content
//! hashes, and the sealed-box construction behind confidential messages.
//!
//! We deliberately chose boring, well-audited cryptography:
//!
//! - **Ed25519** for signatures (via ed25519-dalek).
//! - **X25519** for key agreement: same curve, different clothes.
//! - **AES-256-GCM** for symmetric encryption: AEAD done right.
//! - **BLAKE3** for content addressing and key derivation.
//! - **SHA-256** for the hashcash proof-of-work only.
//!
//! Everything here is a thin, type-safe wrapper around audited
//! implementations. If you're tempted to optimize these functions, go read
//! about timing attacks and come back when you've lost the urge.

pub mod encryption;
pub mod hash;
pub mod keys;

// Re-export the things people actually need so they don't have to memorize
// our module hierarchy.
pub use encryption::{decrypt, encrypt, EncryptionError, SealedBox};
pub use hash::{sha256, ContentHash, KeyHash};
pub use keys::{KeyBundle, KeyError, VeilKeypair, VeilPublicKey, VeilSignature};
