//! Message envelopes and the events exchanged with the transport.
//!
//! An envelope carries one encrypted message plus the metadata needed to
//! authenticate and decrypt it. On the wire it is a JSON object:
//!
//! ```text
//! {"id":…,"sender":…,"content":…,"iv":…,"tag":…,"timestamp":…,"hmac":…}
//! ```
//!
//! Binary fields are transport text (see [`crate::codec`]). The `hmac` covers
//! the canonical form of the other six fields.
//!
//! Opening an envelope is split into two steps so that decryption can only
//! ever run on an envelope whose MAC has already been checked:
//! [`MessageEnvelope::verify`] yields a [`VerifiedEnvelope`], and only a
//! `VerifiedEnvelope` can be decrypted.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{compute_mac, verify_mac};
use crate::cipher::{self, IV_LENGTH, TAG_LENGTH};
use crate::codec::{canonicalize, decode_binary, decode_fixed, encode_binary, CanonicalFields};
use crate::error::{ProtocolError, Result};
use crate::kdf::SessionKeys;

/// Current time as seconds since the Unix epoch, at millisecond precision.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64 / 1000.0)
        .unwrap_or(0.0)
}

/// One encrypted, authenticated message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier for this envelope.
    pub id: String,
    /// Display name of the sender.
    pub sender: String,
    /// AES-GCM ciphertext in transport text.
    #[serde(rename = "content")]
    pub ciphertext: String,
    /// 12-byte IV in transport text.
    pub iv: String,
    /// 16-byte GCM tag in transport text.
    pub tag: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// HMAC-SHA256 of the canonical fields, in transport text.
    pub hmac: String,
}

impl MessageEnvelope {
    /// Encrypts and authenticates `plaintext`, stamped with the current time.
    pub fn seal(keys: &SessionKeys, sender: &str, plaintext: &[u8]) -> Result<Self> {
        Self::seal_at(keys, sender, plaintext, unix_timestamp())
    }

    /// Encrypts and authenticates `plaintext` with an explicit timestamp.
    pub fn seal_at(
        keys: &SessionKeys,
        sender: &str,
        plaintext: &[u8],
        timestamp: f64,
    ) -> Result<Self> {
        let sealed = cipher::encrypt(&keys.encryption, plaintext)?;

        let mut envelope = Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            ciphertext: encode_binary(&sealed.ciphertext),
            iv: encode_binary(&sealed.iv),
            tag: encode_binary(&sealed.tag),
            timestamp,
            hmac: String::new(),
        };

        let mac = compute_mac(&keys.authentication, &envelope.canonical_bytes()?);
        envelope.hmac = encode_binary(&mac);
        Ok(envelope)
    }

    /// Borrows the six MAC-covered fields.
    pub fn canonical_fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            id: &self.id,
            sender: &self.sender,
            ciphertext: &self.ciphertext,
            iv: &self.iv,
            tag: &self.tag,
            timestamp: self.timestamp,
        }
    }

    /// Returns the canonical bytes the MAC is computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonicalize(&self.canonical_fields())
    }

    /// Checks the envelope MAC.
    ///
    /// Fails with [`ProtocolError::MacMismatch`] if the MAC does not verify,
    /// or [`ProtocolError::MalformedEncoding`] if it is not valid transport
    /// text. Nothing is decrypted here.
    pub fn verify(&self, keys: &SessionKeys) -> Result<VerifiedEnvelope<'_>> {
        let mac = decode_binary(&self.hmac)?;
        let canonical = self.canonical_bytes()?;

        if !verify_mac(&keys.authentication, &canonical, &mac) {
            return Err(ProtocolError::MacMismatch {
                id: self.id.clone(),
            });
        }

        Ok(VerifiedEnvelope { envelope: self })
    }

    /// Verifies then decrypts in one step.
    pub fn open(&self, keys: &SessionKeys) -> Result<ReceivedMessage> {
        self.verify(keys)?.decrypt(keys)
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses an envelope from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// An envelope whose MAC has been checked.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedEnvelope<'a> {
    envelope: &'a MessageEnvelope,
}

impl<'a> VerifiedEnvelope<'a> {
    /// The underlying envelope.
    pub fn envelope(&self) -> &'a MessageEnvelope {
        self.envelope
    }

    /// Decrypts the payload.
    ///
    /// The plaintext must be UTF-8; anything else is rejected as an invalid
    /// envelope.
    pub fn decrypt(self, keys: &SessionKeys) -> Result<ReceivedMessage> {
        let envelope = self.envelope;

        let ciphertext = decode_binary(&envelope.ciphertext)?;
        let iv: [u8; IV_LENGTH] = decode_fixed(&envelope.iv, "iv")?;
        let tag: [u8; TAG_LENGTH] = decode_fixed(&envelope.tag, "tag")?;

        let plaintext = cipher::decrypt(&keys.encryption, &ciphertext, &iv, &tag)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| {
            ProtocolError::InvalidEnvelope(format!("envelope {} is not UTF-8 text", envelope.id))
        })?;

        Ok(ReceivedMessage {
            id: envelope.id.clone(),
            sender: envelope.sender.clone(),
            plaintext,
            timestamp: envelope.timestamp,
        })
    }
}

/// A decrypted message ready to hand to the user interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Envelope identifier.
    pub id: String,
    /// Display name of the sender.
    pub sender: String,
    /// Decrypted text.
    pub plaintext: String,
    /// Sender's timestamp in seconds since the Unix epoch.
    pub timestamp: f64,
}

/// A public key published by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOffer {
    /// Display name of the publishing peer.
    #[serde(rename = "username")]
    pub sender: String,
    /// SEC1 public key in transport text.
    pub public_key: String,
}

impl KeyOffer {
    /// Creates a key offer.
    pub fn new(sender: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            public_key: public_key.into(),
        }
    }
}

/// Acknowledgement returned by the transport for a published key or envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request was accepted.
    #[serde(rename = "success")]
    pub accepted: bool,
    /// Reason for a rejection.
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    /// A positive acknowledgement.
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    /// A rejection with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }

    /// Returns the rejection reason, or a placeholder if none was given.
    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("no reason given")
    }
}

/// Inbound events delivered by the transport to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PeerEvent {
    /// The peer published its public key.
    #[serde(rename = "peer_public_key")]
    PublicKey(KeyOffer),
    /// The peer sent an envelope.
    #[serde(rename = "receive_message")]
    Envelope(MessageEnvelope),
    /// The peer left.
    #[serde(rename = "user_disconnected")]
    Disconnected {
        /// Display name of the peer that left.
        #[serde(rename = "username")]
        peer: String,
    },
}
