//! Ephemeral P-256 key agreement.
//!
//! Each channel establishment generates a fresh key pair. The public half is
//! exported as an uncompressed SEC1 point (65 bytes, the same layout as a
//! WebCrypto `raw` export) and sent to the peer; the private half never
//! leaves this process and is dropped when the channel resets.

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::codec::encode_binary;
use crate::error::{ProtocolError, Result};

/// Length of an exported public key (uncompressed SEC1 point).
pub const PUBLIC_KEY_LENGTH: usize = 65;

/// Length of a compressed SEC1 point, also accepted from peers.
pub const COMPRESSED_PUBLIC_KEY_LENGTH: usize = 33;

/// Length of the ECDH output in bytes (256 bits).
pub const SHARED_SECRET_LENGTH: usize = 32;

/// Candidate scalars drawn before giving up. A uniformly random 256-bit
/// value falls outside the P-256 group order with probability below 2^-32.
const MAX_SCALAR_ATTEMPTS: usize = 4;

/// A 256-bit ECDH shared secret.
///
/// Exists only long enough to feed key derivation; zeroed on drop.
pub struct SharedSecret(Zeroizing<[u8; SHARED_SECRET_LENGTH]>);

impl SharedSecret {
    /// Wraps raw secret bytes.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns the raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// A session-local P-256 key pair.
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a fresh key pair from the operating system's CSPRNG.
    ///
    /// Fails with [`ProtocolError::KeyGeneration`] if no randomness is
    /// available. The failure is not retried here; the caller decides.
    pub fn generate() -> Result<Self> {
        Self::generate_with(&mut OsRng)
    }

    /// Generates a key pair from the given random source.
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self> {
        for _ in 0..MAX_SCALAR_ATTEMPTS {
            let mut candidate = Zeroizing::new([0u8; 32]);
            rng.try_fill_bytes(&mut candidate[..])
                .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;

            // Rejects zero and values at or above the group order.
            if let Ok(secret) = SecretKey::from_slice(&candidate[..]) {
                let public = secret.public_key();
                return Ok(Self { secret, public });
            }
        }

        Err(ProtocolError::KeyGeneration(format!(
            "no valid P-256 scalar after {} attempts",
            MAX_SCALAR_ATTEMPTS
        )))
    }

    /// Returns the public key as an uncompressed SEC1 point.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Returns the public key in transport text.
    pub fn public_key_text(&self) -> String {
        encode_binary(&self.public_key_bytes())
    }

    /// Computes the ECDH shared secret with a peer's SEC1-encoded public key.
    ///
    /// Fails with [`ProtocolError::InvalidPeerKey`] if the bytes are not a
    /// valid point on P-256.
    pub fn compute_shared_secret(&self, peer_public_key: &[u8]) -> Result<SharedSecret> {
        let peer = PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| {
            ProtocolError::InvalidPeerKey(format!(
                "{} bytes do not encode a P-256 point",
                peer_public_key.len()
            ))
        })?;

        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut bytes = [0u8; SHARED_SECRET_LENGTH];
        bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(SharedSecret::from_bytes(bytes))
    }
}

/// Human-readable fingerprint of a public key.
///
/// The first 16 bytes of SHA-256 over the SEC1 encoding, as colon-separated
/// groups of four hex characters, for example
/// `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hash[..16]
        .chunks(2)
        .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
        .collect::<Vec<_>>()
        .join(":")
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public_key_text())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}
