//! Transport text encoding and canonical envelope serialization.
//!
//! # Transport text
//!
//! Raw bytes (ciphertext, IV, tag, MAC, public keys) travel as URL-safe
//! base64. Output never carries padding; input is accepted with or without
//! it, since some peers pad and some do not.
//!
//! # Canonical form
//!
//! The MAC covers a compact JSON object holding six envelope fields in a
//! fixed order:
//!
//! ```text
//! {"id":…,"sender":…,"content":…,"iv":…,"tag":…,"timestamp":…}
//! ```
//!
//! `content` is the ciphertext in transport text. `timestamp` is written the
//! way JavaScript's `JSON.stringify` writes numbers: integral values below
//! 10^21 as plain digits, everything else as the shortest round-trip
//! decimal. Exponent forms at 10^21 and above follow Rust's notation
//! (`1e21`, not `1e+21`); no real timestamp reaches them.
//! Both sides must produce identical bytes, so this layout is part of the
//! wire contract.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Serialize, Serializer};

use crate::error::{ProtocolError, Result};

/// URL-safe base64 engine: unpadded output, padding-indifferent input.
const TRANSPORT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Magnitude at which JavaScript starts writing numbers with an exponent.
const PLAIN_DIGITS_LIMIT: f64 = 1e21;

/// Encodes raw bytes as URL-safe transport text.
pub fn encode_binary(bytes: &[u8]) -> String {
    TRANSPORT_ENGINE.encode(bytes)
}

/// Decodes URL-safe transport text back to raw bytes.
///
/// Fails with [`ProtocolError::MalformedEncoding`] on characters outside the
/// URL-safe alphabet or on an impossible length.
pub fn decode_binary(text: &str) -> Result<Vec<u8>> {
    TRANSPORT_ENGINE.decode(text).map_err(ProtocolError::from)
}

/// Decodes transport text that must hold exactly `N` bytes.
pub fn decode_fixed<const N: usize>(text: &str, field: &str) -> Result<[u8; N]> {
    let bytes = decode_binary(text)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ProtocolError::MalformedEncoding(format!(
            "{} must be {} bytes, got {}",
            field,
            N,
            bytes.len()
        ))
    })
}

/// The six MAC-covered envelope fields, borrowed from an envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanonicalFields<'a> {
    /// Unique envelope identifier.
    pub id: &'a str,
    /// Sender display name.
    pub sender: &'a str,
    /// Ciphertext in transport text.
    pub ciphertext: &'a str,
    /// IV in transport text.
    pub iv: &'a str,
    /// AEAD tag in transport text.
    pub tag: &'a str,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Field order of this struct is the canonical order.
#[derive(Serialize)]
struct CanonicalObject<'a> {
    id: &'a str,
    sender: &'a str,
    content: &'a str,
    iv: &'a str,
    tag: &'a str,
    timestamp: CanonicalTimestamp,
}

struct CanonicalTimestamp(f64);

impl Serialize for CanonicalTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = self.0;
        if value.fract() == 0.0 && value.abs() < PLAIN_DIGITS_LIMIT {
            // exact: every integral double below 10^21 fits in an i128
            serializer.serialize_i128(value as i128)
        } else {
            serializer.serialize_f64(value)
        }
    }
}

/// Serializes the MAC-covered fields into their canonical byte form.
///
/// Fails with [`ProtocolError::InvalidEnvelope`] if the timestamp is not a
/// finite number, since JSON has no representation for it.
pub fn canonicalize(fields: &CanonicalFields<'_>) -> Result<Vec<u8>> {
    if !fields.timestamp.is_finite() {
        return Err(ProtocolError::InvalidEnvelope(format!(
            "timestamp must be finite, got {}",
            fields.timestamp
        )));
    }

    let object = CanonicalObject {
        id: fields.id,
        sender: fields.sender,
        content: fields.ciphertext,
        iv: fields.iv,
        tag: fields.tag,
        timestamp: CanonicalTimestamp(fields.timestamp),
    };

    serde_json::to_vec(&object).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
