//! AES-256-GCM payload encryption.
//!
//! Every message gets a fresh random 96-bit IV. The authentication tag is
//! carried separately from the ciphertext so the envelope can expose it as
//! its own field.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::kdf::EncryptionKey;

/// Length of the GCM initialization vector in bytes.
pub const IV_LENGTH: usize = 12;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LENGTH: usize = 16;

/// Output of a single encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Random IV used for this message.
    pub iv: [u8; IV_LENGTH],
    /// GCM authentication tag.
    pub tag: [u8; TAG_LENGTH],
}

/// Encrypts `plaintext` under `key` with a freshly drawn IV.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<SealedMessage> {
    let mut iv = [0u8; IV_LENGTH];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| ProtocolError::Encryption(format!("IV generation failed: {}", e)))?;

    encrypt_with_iv(key, plaintext, iv)
}

fn encrypt_with_iv(
    key: &EncryptionKey,
    plaintext: &[u8],
    iv: [u8; IV_LENGTH],
) -> Result<SealedMessage> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), &[], &mut ciphertext)
        .map_err(|_| ProtocolError::Encryption("AES-GCM rejected the input".to_string()))?;

    let mut tag_bytes = [0u8; TAG_LENGTH];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedMessage {
        ciphertext,
        iv,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates a payload.
///
/// Fails with [`ProtocolError::Decryption`] if the IV or tag has the wrong
/// length, or if the tag does not verify. No plaintext is returned on
/// failure.
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "IV must be {} bytes, got {}",
            IV_LENGTH,
            iv.len()
        )));
    }
    if tag.len() != TAG_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "tag must be {} bytes, got {}",
            TAG_LENGTH,
            tag.len()
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut plaintext = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            &[],
            &mut plaintext,
            Tag::from_slice(tag),
        )
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))?;

    Ok(plaintext)
}
