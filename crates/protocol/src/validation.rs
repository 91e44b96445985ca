//! Input validation for data arriving from a peer.
//!
//! Everything in here runs on untrusted input and only inspects structure:
//! lengths, alphabets and freshness. Authenticity is the job of
//! [`crate::auth`].

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::auth::MAC_LENGTH;
use crate::cipher::{IV_LENGTH, TAG_LENGTH};
use crate::codec::decode_binary;
use crate::envelope::MessageEnvelope;
use crate::error::{ProtocolError, Result};
use crate::keys::{COMPRESSED_PUBLIC_KEY_LENGTH, PUBLIC_KEY_LENGTH};

/// Minimum display name length in characters.
pub const MIN_DISPLAY_NAME_LENGTH: usize = 3;

/// Maximum display name length in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 20;

/// Upper bound on envelope identifier length.
pub const MAX_ENVELOPE_ID_LENGTH: usize = 128;

/// Returns whether `name` is 3 to 20 characters of `[A-Za-z0-9_]`.
pub fn is_valid_display_name(name: &str) -> bool {
    (MIN_DISPLAY_NAME_LENGTH..=MAX_DISPLAY_NAME_LENGTH).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates a display name.
pub fn validate_display_name(name: &str) -> Result<()> {
    if is_valid_display_name(name) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidEnvelope(format!(
            "display name {:?} must be {}-{} characters of letters, digits or underscore",
            name, MIN_DISPLAY_NAME_LENGTH, MAX_DISPLAY_NAME_LENGTH
        )))
    }
}

/// Decodes a peer public key from transport text and checks its framing.
///
/// Accepts a 65-byte uncompressed or 33-byte compressed SEC1 encoding. Curve
/// membership is checked later, during key agreement.
pub fn validate_public_key_text(text: &str) -> Result<Vec<u8>> {
    if text.is_empty() {
        return Err(ProtocolError::InvalidPeerKey("empty public key".to_string()));
    }

    let bytes = decode_binary(text)
        .map_err(|e| ProtocolError::InvalidPeerKey(format!("public key is not transport text: {}", e)))?;

    let well_framed = match bytes.len() {
        PUBLIC_KEY_LENGTH => bytes[0] == 0x04,
        COMPRESSED_PUBLIC_KEY_LENGTH => bytes[0] == 0x02 || bytes[0] == 0x03,
        _ => false,
    };

    if !well_framed {
        return Err(ProtocolError::InvalidPeerKey(format!(
            "expected a {} or {} byte SEC1 point, got {} bytes",
            PUBLIC_KEY_LENGTH,
            COMPRESSED_PUBLIC_KEY_LENGTH,
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Checks the structure of an envelope without any keys.
///
/// `max_ciphertext` bounds the decoded ciphertext length. AES-GCM ciphertext
/// is the same length as the plaintext.
pub fn validate_envelope_shape(envelope: &MessageEnvelope, max_ciphertext: usize) -> Result<()> {
    if envelope.id.is_empty() || envelope.id.len() > MAX_ENVELOPE_ID_LENGTH {
        return Err(ProtocolError::InvalidEnvelope(format!(
            "id must be 1-{} characters",
            MAX_ENVELOPE_ID_LENGTH
        )));
    }

    validate_display_name(&envelope.sender)?;

    if !envelope.timestamp.is_finite() || envelope.timestamp < 0.0 {
        return Err(ProtocolError::InvalidEnvelope(format!(
            "timestamp must be a non-negative number, got {}",
            envelope.timestamp
        )));
    }

    expect_length(&envelope.iv, "iv", IV_LENGTH)?;
    expect_length(&envelope.tag, "tag", TAG_LENGTH)?;
    expect_length(&envelope.hmac, "hmac", MAC_LENGTH)?;

    let ciphertext = decode_binary(&envelope.ciphertext)?;
    if ciphertext.len() > max_ciphertext {
        return Err(ProtocolError::InvalidEnvelope(format!(
            "content is {} bytes, limit is {}",
            ciphertext.len(),
            max_ciphertext
        )));
    }

    Ok(())
}

fn expect_length(text: &str, field: &str, expected: usize) -> Result<()> {
    let len = decode_binary(text)?.len();
    if len != expected {
        return Err(ProtocolError::MalformedEncoding(format!(
            "{} must be {} bytes, got {}",
            field, expected, len
        )));
    }
    Ok(())
}

/// Rejects envelopes that are stale or have been seen before.
///
/// Keeps a bounded set of recent envelope ids; once full, the oldest id is
/// forgotten first.
#[derive(Debug)]
pub struct ReplayGuard {
    window: Duration,
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl ReplayGuard {
    /// Creates a guard accepting timestamps within `window` of local time
    /// and remembering up to `capacity` ids.
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Checks one envelope and records its id if it passes.
    ///
    /// `now` is local time in seconds since the Unix epoch.
    pub fn check(&mut self, id: &str, timestamp: f64, now: f64) -> Result<()> {
        self.check_fresh(id, timestamp, now)?;
        self.record(id);
        Ok(())
    }

    /// Checks freshness without recording the id.
    ///
    /// Pair with [`record`](Self::record) once the envelope is accepted.
    pub fn check_fresh(&self, id: &str, timestamp: f64, now: f64) -> Result<()> {
        let skew = (now - timestamp).abs();
        if !skew.is_finite() || skew > self.window.as_secs_f64() {
            return Err(ProtocolError::Replay(format!(
                "envelope {} timestamp is {:.1}s from local time (window {}s)",
                id,
                skew,
                self.window.as_secs()
            )));
        }

        if self.seen.contains(id) {
            return Err(ProtocolError::Replay(format!("envelope {} already received", id)));
        }

        Ok(())
    }

    /// Remembers an accepted id, evicting the oldest when full.
    pub fn record(&mut self, id: &str) {
        if !self.seen.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns whether no ids are remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forgets every remembered id.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_binary;
    use crate::kdf::derive_session_keys;
    use crate::keys::{EphemeralKeyPair, SharedSecret};

    const NOW: f64 = 1_700_000_000.0;

    fn sample_envelope() -> MessageEnvelope {
        let keys = derive_session_keys(&SharedSecret::from_bytes([1; 32]));
        MessageEnvelope::seal_at(&keys, "alice", b"hello", NOW).unwrap()
    }

    #[test]
    fn test_display_names() {
        assert!(is_valid_display_name("bob"));
        assert!(is_valid_display_name("alice_99"));
        assert!(is_valid_display_name("abcdefghij0123456789"));

        assert!(!is_valid_display_name("ab"));
        assert!(!is_valid_display_name("abcdefghij01234567890"));
        assert!(!is_valid_display_name("bob smith"));
        assert!(!is_valid_display_name("bob-smith"));
        assert!(!is_valid_display_name("bøb"));
        assert!(!is_valid_display_name(""));

        assert!(validate_display_name("bob").is_ok());
        assert!(matches!(
            validate_display_name("b!"),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_public_key_text_accepted() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let bytes = validate_public_key_text(&pair.public_key_text()).unwrap();
        assert_eq!(bytes, pair.public_key_bytes());
    }

    #[test]
    fn test_public_key_text_rejected() {
        assert!(matches!(
            validate_public_key_text(""),
            Err(ProtocolError::InvalidPeerKey(_))
        ));
        assert!(matches!(
            validate_public_key_text("not base64!"),
            Err(ProtocolError::InvalidPeerKey(_))
        ));
        assert!(matches!(
            validate_public_key_text(&encode_binary(&[0x04; 64])),
            Err(ProtocolError::InvalidPeerKey(_))
        ));

        let mut wrong_prefix = [0x04u8; PUBLIC_KEY_LENGTH];
        wrong_prefix[0] = 0x05;
        assert!(matches!(
            validate_public_key_text(&encode_binary(&wrong_prefix)),
            Err(ProtocolError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_envelope_shape_accepts_sealed() {
        assert!(validate_envelope_shape(&sample_envelope(), 1024).is_ok());
    }

    #[test]
    fn test_envelope_shape_rejects_bad_fields() {
        let mut envelope = sample_envelope();
        envelope.id.clear();
        assert!(matches!(
            validate_envelope_shape(&envelope, 1024),
            Err(ProtocolError::InvalidEnvelope(_))
        ));

        let mut envelope = sample_envelope();
        envelope.sender = "x".to_string();
        assert!(validate_envelope_shape(&envelope, 1024).is_err());

        let mut envelope = sample_envelope();
        envelope.timestamp = f64::NAN;
        assert!(matches!(
            validate_envelope_shape(&envelope, 1024),
            Err(ProtocolError::InvalidEnvelope(_))
        ));

        let mut envelope = sample_envelope();
        envelope.iv = encode_binary(&[0u8; 8]);
        assert!(matches!(
            validate_envelope_shape(&envelope, 1024),
            Err(ProtocolError::MalformedEncoding(_))
        ));

        let mut envelope = sample_envelope();
        envelope.hmac = "%%%".to_string();
        assert!(matches!(
            validate_envelope_shape(&envelope, 1024),
            Err(ProtocolError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_envelope_shape_enforces_size() {
        let envelope = sample_envelope();
        assert!(validate_envelope_shape(&envelope, 5).is_ok());
        assert!(matches!(
            validate_envelope_shape(&envelope, 4),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_replay_duplicate_id() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 1000);

        assert!(guard.check("a", NOW, NOW).is_ok());
        assert!(matches!(
            guard.check("a", NOW, NOW),
            Err(ProtocolError::Replay(_))
        ));
        assert!(guard.check("b", NOW, NOW).is_ok());
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_replay_window() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 1000);

        assert!(guard.check("past", NOW - 30.0, NOW).is_ok());
        assert!(guard.check("future", NOW + 29.5, NOW).is_ok());
        assert!(matches!(
            guard.check("old", NOW - 30.5, NOW),
            Err(ProtocolError::Replay(_))
        ));
        assert!(matches!(
            guard.check("ahead", NOW + 31.0, NOW),
            Err(ProtocolError::Replay(_))
        ));
        assert!(guard.check("nan", f64::NAN, NOW).is_err());
    }

    #[test]
    fn test_rejected_ids_are_not_recorded() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 1000);

        assert!(guard.check("late", NOW - 100.0, NOW).is_err());
        assert!(guard.is_empty());
        assert!(guard.check("late", NOW, NOW).is_ok());
    }

    #[test]
    fn test_check_fresh_does_not_record() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 1000);

        assert!(guard.check_fresh("pending", NOW, NOW).is_ok());
        assert!(guard.is_empty());
        assert!(guard.check_fresh("pending", NOW, NOW).is_ok());

        guard.record("pending");
        guard.record("pending");
        assert_eq!(guard.len(), 1);
        assert!(matches!(
            guard.check_fresh("pending", NOW, NOW),
            Err(ProtocolError::Replay(_))
        ));
    }

    #[test]
    fn test_replay_cache_evicts_oldest() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 3);

        for id in ["1", "2", "3", "4"] {
            guard.check(id, NOW, NOW).unwrap();
        }
        assert_eq!(guard.len(), 3);

        // "1" was evicted
        assert!(guard.check("1", NOW, NOW).is_ok());
        assert!(guard.check("3", NOW, NOW).is_err());
    }

    #[test]
    fn test_replay_clear() {
        let mut guard = ReplayGuard::new(Duration::from_secs(30), 10);
        guard.check("a", NOW, NOW).unwrap();
        guard.clear();

        assert!(guard.is_empty());
        assert!(guard.check("a", NOW, NOW).is_ok());
    }
}
