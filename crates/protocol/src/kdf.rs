//! Session key derivation using HKDF-SHA256.
//!
//! The ECDH shared secret is expanded twice, once per purpose:
//!
//! ```text
//! encryption key = HKDF(salt = "",        ikm = secret, info = "chat_secure_keys" || "/aes-256-gcm")
//! auth key       = HKDF(salt = 0x00 * 32, ikm = secret, info = "chat_secure_keys" || "/hmac-sha256")
//! ```
//!
//! HMAC pads short keys with zeros, so an empty salt and a 32-byte zero
//! salt produce the same extract step. The purpose label on the info string
//! is what keeps the two outputs independent.
//!
//! The labels are a deliberate break from clients that expand with the bare
//! `chat_secure_keys` info string. Those clients derive different keys and
//! cannot talk to a channel using this module.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::keys::SharedSecret;

/// Context string shared by both derivations.
pub const KEY_CONTEXT: &[u8] = b"chat_secure_keys";

/// Size of each derived key in bytes (256 bits).
pub const SESSION_KEY_LENGTH: usize = 32;

const ENCRYPTION_SALT: &[u8] = &[];
const AUTHENTICATION_SALT: [u8; 32] = [0u8; 32];

const ENCRYPTION_LABEL: &[u8] = b"/aes-256-gcm";
const AUTHENTICATION_LABEL: &[u8] = b"/hmac-sha256";

/// AES-256-GCM key.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; SESSION_KEY_LENGTH]>);

impl EncryptionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

/// HMAC-SHA256 key.
#[derive(Clone)]
pub struct AuthKey(Zeroizing<[u8; SESSION_KEY_LENGTH]>);

impl AuthKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

/// The two keys protecting a channel for one session.
#[derive(Clone)]
pub struct SessionKeys {
    /// Encrypts message payloads.
    pub encryption: EncryptionKey,
    /// Authenticates envelopes.
    pub authentication: AuthKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("encryption", &"[REDACTED]")
            .field("authentication", &"[REDACTED]")
            .finish()
    }
}

/// Derives the session key pair from an ECDH shared secret.
///
/// Deterministic: both peers arrive at the same keys from the same secret.
pub fn derive_session_keys(secret: &SharedSecret) -> SessionKeys {
    let encryption = expand(secret.as_bytes(), ENCRYPTION_SALT, ENCRYPTION_LABEL);
    let authentication = expand(secret.as_bytes(), &AUTHENTICATION_SALT, AUTHENTICATION_LABEL);

    SessionKeys {
        encryption: EncryptionKey::from_bytes(encryption),
        authentication: AuthKey::from_bytes(authentication),
    }
}

fn expand(ikm: &[u8], salt: &[u8], label: &[u8]) -> [u8; SESSION_KEY_LENGTH] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut info = Vec::with_capacity(KEY_CONTEXT.len() + label.len());
    info.extend_from_slice(KEY_CONTEXT);
    info.extend_from_slice(label);

    let mut okm = [0u8; SESSION_KEY_LENGTH];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    okm
}
