//! # Key Management
//!
//! Ed25519 identity keys and the X25519 encryption keys derived alongside
//! them. Every peer on the overlay holds at least one [`KeyBundle`]: the
//! Ed25519 half signs storage requests and handshake material, the X25519
//! half receives confidential messages via ephemeral Diffie-Hellman.
//!
//! ## Why Ed25519?
//!
//! - Deterministic signatures (no k-value footguns like ECDSA).
//! - 128-bit security level in 32+32 bytes. Compact and sufficient.
//! - Fast verification, which matters when every gossiped storage request
//!   carries a signature that untrusted peers must check.
//!
//! ## Security considerations
//!
//! - We use the OS RNG (`OsRng`) for key generation. If your OS RNG is
//!   broken, you have bigger problems than VEIL.
//! - Key bytes are never logged. If you add logging to this module,
//!   you will be asked to leave.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::hash::KeyHash;

/// Errors that can occur during key operations.
///
/// Intentionally vague about *why* something failed. Leaking details about
/// key material through error messages is a classic footgun.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not a valid scalar")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

// ---------------------------------------------------------------------------
// VeilKeypair
// ---------------------------------------------------------------------------

/// A VEIL identity keypair wrapping an Ed25519 signing key.
///
/// This is the atomic unit of identity on the overlay. Every storage
/// request, every handshake token, every mailbox retraction ultimately
/// traces back to one of these.
///
/// ## Serialization
///
/// `VeilKeypair` intentionally does NOT implement `Serialize`/`Deserialize`.
/// Serializing private keys should be a deliberate, conscious act, not
/// something that happens because someone shoved a keypair into a debug
/// dump. Use `to_bytes()` / `from_bytes()` explicitly.
pub struct VeilKeypair {
    signing_key: SigningKey,
}

/// The public half of a VEIL identity, safe to share with the world.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeilPublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature over a message.
///
/// Stored as `Vec<u8>` for serde compatibility, but always exactly 64 bytes
/// when produced by us. If someone hands you a signature that isn't 64
/// bytes, verification simply returns `false`. No panics.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeilSignature {
    bytes: Vec<u8>,
}

impl VeilKeypair {
    /// Generate a fresh keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// In Ed25519 the 32-byte secret key *is* the seed. Useful for test
    /// fixtures and for deriving identities from recovered secrets.
    ///
    /// **Warning**: a weak seed gives you a weak key. Use a proper CSPRNG
    /// or KDF to produce the seed bytes.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key, e.g. from the
    /// daemon's identity file.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(KeyError::InvalidSecretKey);
        }
        let mut arr = [0u8; SECRET_KEY_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_seed(&arr))
    }

    /// Returns the public key associated with this keypair.
    pub fn public_key(&self) -> VeilPublicKey {
        VeilPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign a message.
    ///
    /// Ed25519 signatures are deterministic: the same (key, message) pair
    /// always produces the same signature. No nonce management needed at
    /// signing time.
    pub fn sign(&self, message: &[u8]) -> VeilSignature {
        let sig = self.signing_key.sign(message);
        VeilSignature {
            bytes: sig.to_bytes().to_vec(),
        }
    }

    /// Verify a signature against this keypair's public key.
    pub fn verify(&self, message: &[u8], signature: &VeilSignature) -> bool {
        self.public_key().verify(message, signature)
    }

    /// Export the raw 32-byte secret key material.
    ///
    /// **Handle with extreme care.** This is the only secret that stands
    /// between an attacker and full control of the associated identity.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for VeilKeypair {
    /// Cloning a keypair is allowed but should make you uncomfortable.
    /// Every copy of a private key is another thing to protect.
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for VeilKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret key material in debug output. Not even partially.
        write!(f, "VeilKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// VeilPublicKey
// ---------------------------------------------------------------------------

impl VeilPublicKey {
    /// Create a public key from raw bytes without validation.
    ///
    /// Only use this for bytes that came out of our own constructors. For
    /// untrusted input, use [`try_from_slice`](Self::try_from_slice).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Try to create a public key from an untrusted byte slice.
    ///
    /// Validates the length and that the bytes are a valid Ed25519 point.
    /// Low-order points and other degenerate encodings are rejected here
    /// rather than surfacing later as mysterious verification failures.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        if slice.len() != 32 {
            return Err(KeyError::InvalidPublicKey);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The BLAKE3 hash of this key. This is the identity attached to stored
    /// data: storage requests carry key hashes, not full keys, and removal
    /// authority is decided by hash equality.
    pub fn key_hash(&self) -> KeyHash {
        KeyHash::of(&self.bytes)
    }

    /// Verify a signature against this public key.
    ///
    /// Returns a plain boolean because the vast majority of callers want a
    /// yes/no answer and don't care about the specific failure mode.
    pub fn verify(&self, message: &[u8], signature: &VeilSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig_bytes: [u8; 64] = match signature.bytes.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let dalek_sig = DalekSignature::from_bytes(&sig_bytes);
        verifying_key.verify(message, &dalek_sig).is_ok()
    }

    /// Hex-encoded representation. 64 characters for 32 bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Base58-encoded representation, the short form users see.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.bytes).into_string()
    }
}

impl Hash for VeilPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for VeilPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for VeilPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VeilPublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// VeilSignature
// ---------------------------------------------------------------------------

impl VeilSignature {
    /// Create a signature from its raw 64-byte representation.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex-encoded signature string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for VeilSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        if hex_str.len() >= 128 {
            write!(f, "VeilSignature({}...{})", &hex_str[..8], &hex_str[120..])
        } else {
            write!(f, "VeilSignature({})", hex_str)
        }
    }
}

// ---------------------------------------------------------------------------
// KeyBundle
// ---------------------------------------------------------------------------

/// The full key material of one local network identity: an Ed25519 signing
/// keypair plus a static X25519 secret for receiving confidential messages.
///
/// The two keys are independent. Deriving the X25519 key from the Ed25519
/// seed would be possible but couples the lifetimes of signing and
/// decryption capability, which we don't want: rotating one must not
/// invalidate the other.
pub struct KeyBundle {
    keypair: VeilKeypair,
    encryption_secret: StaticSecret,
}

impl KeyBundle {
    /// Generate a fresh bundle with both keys from the OS RNG.
    pub fn generate() -> Self {
        Self {
            keypair: VeilKeypair::generate(),
            encryption_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild a bundle from persisted secret material.
    pub fn from_secrets(signing_seed: &[u8; 32], encryption_secret: &[u8; 32]) -> Self {
        Self {
            keypair: VeilKeypair::from_seed(signing_seed),
            encryption_secret: StaticSecret::from(*encryption_secret),
        }
    }

    /// The signing keypair.
    pub fn keypair(&self) -> &VeilKeypair {
        &self.keypair
    }

    /// The Ed25519 public key of this identity.
    pub fn public_key(&self) -> VeilPublicKey {
        self.keypair.public_key()
    }

    /// The hash under which stored data is attributed to this identity.
    pub fn key_hash(&self) -> KeyHash {
        self.public_key().key_hash()
    }

    /// The X25519 public key peers use to seal messages for us.
    pub fn encryption_public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.encryption_secret).to_bytes()
    }

    /// The static X25519 secret, needed to open sealed messages.
    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    /// Export both secrets for persistence: `(signing_seed, encryption_secret)`.
    pub fn to_secret_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.keypair.to_bytes(), self.encryption_secret.to_bytes())
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBundle(pub={})", self.public_key().to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = VeilKeypair::generate();
        let msg = b"add request over hash 42";
        let sig = kp.sign(msg);
        assert!(kp.verify(msg, &sig));
    }

    #[test]
    fn wrong_message_fails_verification() {
        let kp = VeilKeypair::generate();
        let sig = kp.sign(b"correct message");
        assert!(!kp.verify(b"wrong message", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = VeilKeypair::generate();
        let kp2 = VeilKeypair::generate();
        let sig = kp1.sign(b"message");
        assert!(!kp2.verify(b"message", &sig));
    }

    #[test]
    fn deterministic_from_seed() {
        let seed = [42u8; 32];
        let kp1 = VeilKeypair::from_seed(&seed);
        let kp2 = VeilKeypair::from_seed(&seed);
        assert_eq!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn secret_roundtrip_hex() {
        let kp = VeilKeypair::generate();
        let restored = VeilKeypair::from_hex(&hex::encode(kp.to_bytes())).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn invalid_hex_rejected() {
        assert!(VeilKeypair::from_hex("deadbeef").is_err());
        assert!(VeilKeypair::from_hex("not-hex-at-all").is_err());
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!(VeilPublicKey::try_from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn key_hash_is_stable() {
        let kp = VeilKeypair::generate();
        assert_eq!(kp.public_key().key_hash(), kp.public_key().key_hash());
    }

    #[test]
    fn distinct_keys_distinct_hashes() {
        let a = VeilKeypair::generate().public_key().key_hash();
        let b = VeilKeypair::generate().public_key().key_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = VeilKeypair::generate();
        let debug_str = format!("{:?}", kp);
        assert!(debug_str.starts_with("VeilKeypair(pub="));
        assert!(!debug_str.contains("signing_key"));
    }

    #[test]
    fn bundle_secret_roundtrip() {
        let bundle = KeyBundle::generate();
        let (seed, enc) = bundle.to_secret_bytes();
        let restored = KeyBundle::from_secrets(&seed, &enc);
        assert_eq!(bundle.public_key(), restored.public_key());
        assert_eq!(
            bundle.encryption_public_key(),
            restored.encryption_public_key()
        );
    }

    #[test]
    fn bundle_keys_are_independent() {
        // The encryption key must not be derivable by accident from the
        // signing key bytes.
        let bundle = KeyBundle::generate();
        assert_ne!(
            bundle.encryption_public_key(),
            *bundle.public_key().as_bytes()
        );
    }
}
