//! Error types for the protocol crate.

use thiserror::Error;

/// How a failure affects the channel that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The key exchange is lost; the channel is back in `Idle`.
    FatalToChannel,
    /// Only the current message is dropped; the channel state is unchanged.
    PerMessage,
    /// The caller sequenced operations incorrectly (e.g. sent before `Ready`).
    ProgrammerError,
    /// The transport failed to carry or acknowledge a message.
    Transport,
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Key agreement errors
    /// The cryptographic provider could not produce a key pair.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The peer's public key is not a valid P-256 point.
    #[error("invalid peer public key: {0}")]
    InvalidPeerKey(String),

    /// The peer refused our key offer.
    #[error("key exchange rejected: {0}")]
    KeyExchangeRejected(String),

    // Cipher errors
    /// Session keys have not been derived yet.
    #[error("encryption unavailable: channel is not ready")]
    EncryptionUnavailable,

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption or tag verification failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The envelope MAC did not verify.
    #[error("message authentication failed for envelope {id}")]
    MacMismatch {
        /// Identifier of the rejected envelope.
        id: String,
    },

    // Codec errors
    /// Transport text could not be decoded to bytes.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// Envelope fields are missing, mistyped or out of range.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope was already seen or its timestamp is outside the window.
    #[error("replayed envelope: {0}")]
    Replay(String),

    /// The peer acknowledged an envelope with a rejection.
    #[error("delivery rejected: {0}")]
    DeliveryRejected(String),

    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Channel errors
    /// Operation is not valid in the current channel state.
    #[error("invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        /// The attempted action.
        action: &'static str,
        /// The state the channel was in.
        state: String,
    },

    /// The channel was reset while the operation was suspended.
    #[error("stale operation: channel was reset during {0}")]
    StaleOperation(&'static str),

    // Transport errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl ProtocolError {
    /// Returns how this error affects the channel.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::KeyGeneration(_)
            | ProtocolError::InvalidPeerKey(_)
            | ProtocolError::KeyExchangeRejected(_) => ErrorClass::FatalToChannel,
            ProtocolError::Decryption(_)
            | ProtocolError::MacMismatch { .. }
            | ProtocolError::MalformedEncoding(_)
            | ProtocolError::InvalidEnvelope(_)
            | ProtocolError::Replay(_)
            | ProtocolError::DeliveryRejected(_)
            | ProtocolError::Deserialization(_) => ErrorClass::PerMessage,
            ProtocolError::EncryptionUnavailable
            | ProtocolError::Encryption(_)
            | ProtocolError::Serialization(_)
            | ProtocolError::InvalidTransition { .. }
            | ProtocolError::StaleOperation(_) => ErrorClass::ProgrammerError,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Timeout(_) => {
                ErrorClass::Transport
            }
        }
    }

    /// Returns whether the channel keeps its state after this error.
    pub fn is_recoverable(&self) -> bool {
        self.class() != ErrorClass::FatalToChannel
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::MalformedEncoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_error_display() {
        let err = ProtocolError::KeyGeneration("entropy source unavailable".to_string());
        assert_eq!(
            err.to_string(),
            "key generation failed: entropy source unavailable"
        );
    }

    #[test]
    fn test_invalid_peer_key_error_display() {
        let err = ProtocolError::InvalidPeerKey("point not on curve".to_string());
        assert_eq!(err.to_string(), "invalid peer public key: point not on curve");
    }

    #[test]
    fn test_encryption_unavailable_error_display() {
        let err = ProtocolError::EncryptionUnavailable;
        assert_eq!(
            err.to_string(),
            "encryption unavailable: channel is not ready"
        );
    }

    #[test]
    fn test_mac_mismatch_error_display() {
        let err = ProtocolError::MacMismatch {
            id: "msg-42".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "message authentication failed for envelope msg-42"
        );
    }

    #[test]
    fn test_invalid_transition_error_display() {
        let err = ProtocolError::InvalidTransition {
            action: "connect",
            state: "Ready".to_string(),
        };
        assert_eq!(err.to_string(), "invalid transition: cannot connect while Ready");
    }

    #[test]
    fn test_stale_operation_error_display() {
        let err = ProtocolError::StaleOperation("key exchange");
        assert_eq!(
            err.to_string(),
            "stale operation: channel was reset during key exchange"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ProtocolError::InvalidPeerKey(String::new()).class(),
            ErrorClass::FatalToChannel
        );
        assert_eq!(
            ProtocolError::KeyGeneration(String::new()).class(),
            ErrorClass::FatalToChannel
        );
        assert_eq!(
            ProtocolError::MacMismatch { id: String::new() }.class(),
            ErrorClass::PerMessage
        );
        assert_eq!(
            ProtocolError::Decryption(String::new()).class(),
            ErrorClass::PerMessage
        );
        assert_eq!(
            ProtocolError::MalformedEncoding(String::new()).class(),
            ErrorClass::PerMessage
        );
        assert_eq!(
            ProtocolError::DeliveryRejected(String::new()).class(),
            ErrorClass::PerMessage
        );
        assert_eq!(
            ProtocolError::EncryptionUnavailable.class(),
            ErrorClass::ProgrammerError
        );
        assert_eq!(
            ProtocolError::Timeout(String::new()).class(),
            ErrorClass::Transport
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(ProtocolError::Decryption(String::new()).is_recoverable());
        assert!(!ProtocolError::InvalidPeerKey(String::new()).is_recoverable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_base64_error() {
        use base64::Engine;
        let b64_err = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode("***")
            .unwrap_err();
        let protocol_err: ProtocolError = b64_err.into();
        assert!(matches!(protocol_err, ProtocolError::MalformedEncoding(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
