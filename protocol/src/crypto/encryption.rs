//! # Encryption
//!
//! Two layers live here:
//!
//! 1. **Raw AES-256-GCM** helpers. AEAD with random 96-bit nonces, used
//!    wherever a symmetric key already exists. The wire format is
//!    `nonce || ciphertext` in a single buffer; the 16-byte auth tag is
//!    appended by GCM internally.
//! 2. **[`SealedBox`]**, the hybrid construction behind confidential
//!    messages: an ephemeral X25519 key agreement with the receiver's
//!    static encryption key, a BLAKE3 key derivation, AES-256-GCM for the
//!    payload, and an Ed25519 signature binding the ciphertext to the
//!    sender's identity.
//!
//! ## Nonce management
//!
//! GCM is notoriously unforgiving about nonce reuse. Our strategy: random
//! 96-bit nonces from the OS CSPRNG, and a fresh ephemeral key per sealed
//! box, so the (key, nonce) pair never repeats. Don't try to be clever with
//! counter-based nonces here.
//!
//! ## Why sign-after-encrypt?
//!
//! The signature covers `ephemeral_public || ciphertext`, so a relay cannot
//! re-attribute a sealed message to a different sender without producing a
//! fresh signature. The receiver verifies before decrypting; garbage is
//! rejected at signature cost, not decryption cost.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

use super::keys::{KeyBundle, VeilKeypair, VeilPublicKey, VeilSignature};

/// Domain separation string for the sealed-box key derivation. Changing
/// this is a wire-format break.
const SEALED_BOX_KDF_CONTEXT: &str = "veil.confidential.v1";

/// Errors that can occur during encryption/decryption.
///
/// Deliberately vague. The difference between "wrong key" and "corrupted
/// ciphertext" is none of an attacker's business.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed: wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {AES_NONCE_LENGTH} bytes")]
    CiphertextTooShort,

    #[error("sender signature over sealed payload is invalid")]
    SignatureInvalid,
}

/// Encrypt plaintext with AES-256-GCM using a random nonce.
///
/// Returns `nonce || ciphertext` as a single `Vec<u8>`.
pub fn encrypt(key: &[u8; AES_KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data previously produced by [`encrypt`].
///
/// Fails on a wrong key, a flipped bit, or a truncated buffer, and does not
/// distinguish between those cases on purpose.
pub fn decrypt(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptFailed)
}

// ---------------------------------------------------------------------------
// SealedBox
// ---------------------------------------------------------------------------

/// A confidential payload sealed for exactly one receiver.
///
/// Only the holder of the receiver's static X25519 secret can derive the
/// symmetric key; everyone (including relays and mailbox stores) can verify
/// which sender identity produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Ephemeral X25519 public key, one per sealed box. Forward secrecy on
    /// the sender side: the matching secret is dropped after sealing.
    pub ephemeral_public: [u8; 32],
    /// `nonce || ciphertext` as produced by [`encrypt`].
    pub ciphertext: Vec<u8>,
    /// The sender's Ed25519 identity key.
    pub sender_public_key: VeilPublicKey,
    /// Ed25519 signature over `ephemeral_public || ciphertext`.
    pub signature: VeilSignature,
}

impl SealedBox {
    /// Seal `plaintext` for the holder of `receiver_encryption_key` and sign
    /// it as `sender`.
    pub fn seal(
        plaintext: &[u8],
        receiver_encryption_key: &[u8; 32],
        sender: &VeilKeypair,
    ) -> Result<Self, EncryptionError> {
        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_public = X25519PublicKey::from(&eph_secret).to_bytes();

        let receiver_public = X25519PublicKey::from(*receiver_encryption_key);
        let shared = eph_secret.diffie_hellman(&receiver_public);
        let key = blake3::derive_key(SEALED_BOX_KDF_CONTEXT, shared.as_bytes());

        let ciphertext = encrypt(&key, plaintext)?;

        let mut signed_bytes = Vec::with_capacity(32 + ciphertext.len());
        signed_bytes.extend_from_slice(&eph_public);
        signed_bytes.extend_from_slice(&ciphertext);
        let signature = sender.sign(&signed_bytes);

        Ok(Self {
            ephemeral_public: eph_public,
            ciphertext,
            sender_public_key: sender.public_key(),
            signature,
        })
    }

    /// Open a sealed box with the receiver's key bundle.
    ///
    /// Verifies the sender signature first, then derives the shared key and
    /// decrypts. Returns the plaintext.
    pub fn open(&self, receiver: &KeyBundle) -> Result<Vec<u8>, EncryptionError> {
        if !self.verify_signature() {
            return Err(EncryptionError::SignatureInvalid);
        }

        let eph_public = X25519PublicKey::from(self.ephemeral_public);
        let shared = receiver.encryption_secret().diffie_hellman(&eph_public);
        let key = blake3::derive_key(SEALED_BOX_KDF_CONTEXT, shared.as_bytes());

        decrypt(&key, &self.ciphertext)
    }

    /// Check the sender signature without attempting decryption. Relays use
    /// this; they never hold the decryption key.
    pub fn verify_signature(&self) -> bool {
        let mut signed_bytes = Vec::with_capacity(32 + self.ciphertext.len());
        signed_bytes.extend_from_slice(&self.ephemeral_public);
        signed_bytes.extend_from_slice(&self.ciphertext);
        self.sender_public_key.verify(&signed_bytes, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let sealed = encrypt(&key, plaintext).unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let key = test_key();
        let sealed = encrypt(&key, b"secret").unwrap();
        let mut wrong_key = test_key();
        wrong_key[0] ^= 0xFF;
        assert!(decrypt(&wrong_key, &sealed).is_err());
    }

    #[test]
    fn modified_ciphertext_fails_decryption() {
        let key = test_key();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        sealed[AES_NONCE_LENGTH] ^= 0xFF;
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn truncated_input_rejected() {
        let key = test_key();
        assert!(decrypt(&key, &[0u8; 4]).is_err());
    }

    #[test]
    fn nonces_are_unique() {
        // Two encryptions of the same message must differ in their nonce
        // prefix. If this ever fails, the RNG is broken and we have much
        // bigger problems.
        let key = test_key();
        let a = encrypt(&key, b"message").unwrap();
        let b = encrypt(&key, b"message").unwrap();
        assert_ne!(&a[..AES_NONCE_LENGTH], &b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn sealed_box_roundtrip() {
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();

        let boxed =
            SealedBox::seal(b"meet at dawn", &receiver.encryption_public_key(), &sender).unwrap();
        assert!(boxed.verify_signature());
        assert_eq!(boxed.open(&receiver).unwrap(), b"meet at dawn");
    }

    #[test]
    fn sealed_box_wrong_receiver_fails() {
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let eavesdropper = KeyBundle::generate();

        let boxed =
            SealedBox::seal(b"meet at dawn", &receiver.encryption_public_key(), &sender).unwrap();
        assert!(boxed.open(&eavesdropper).is_err());
    }

    #[test]
    fn sealed_box_tamper_detected() {
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();

        let mut boxed =
            SealedBox::seal(b"meet at dawn", &receiver.encryption_public_key(), &sender).unwrap();
        let last = boxed.ciphertext.len() - 1;
        boxed.ciphertext[last] ^= 0x01;

        // The signature check catches the mutation before decryption runs.
        assert!(matches!(
            boxed.open(&receiver),
            Err(EncryptionError::SignatureInvalid)
        ));
    }

    #[test]
    fn sealed_box_reattribution_detected() {
        let sender = VeilKeypair::generate();
        let imposter = VeilKeypair::generate();
        let receiver = KeyBundle::generate();

        let mut boxed =
            SealedBox::seal(b"meet at dawn", &receiver.encryption_public_key(), &sender).unwrap();
        // Swapping in another identity key invalidates the signature.
        boxed.sender_public_key = imposter.public_key();
        assert!(!boxed.verify_signature());
    }

    #[test]
    fn sealed_box_empty_plaintext() {
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let boxed = SealedBox::seal(b"", &receiver.encryption_public_key(), &sender).unwrap();
        assert!(boxed.open(&receiver).unwrap().is_empty());
    }
}
