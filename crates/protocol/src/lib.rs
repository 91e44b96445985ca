//! # SecureChat Protocol Library
//!
//! End-to-end encryption for a two-party chat channel. The relay that carries
//! traffic between peers only ever sees public keys and sealed envelopes.
//!
//! ## Overview
//!
//! - **Key agreement**: ephemeral P-256 ECDH per channel establishment
//! - **Key derivation**: HKDF-SHA256 into independent encryption and
//!   authentication keys
//! - **Cipher**: AES-256-GCM with a fresh random IV per message
//! - **Authentication**: HMAC-SHA256 over a canonical form of the envelope,
//!   checked before decryption
//! - **Channel**: a state machine sequencing key exchange and message flow
//!   over a pluggable [`Transport`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             SecureChannel               │  Idle → … → Ready
//! ├─────────────────────────────────────────┤
//! │     MessageEnvelope (seal / verify)     │  JSON, URL-safe base64
//! ├───────────────────┬─────────────────────┤
//! │   AES-256-GCM     │    HMAC-SHA256      │
//! ├───────────────────┴─────────────────────┤
//! │   HKDF-SHA256  ←  P-256 ECDH secret     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use securechat_protocol::{derive_session_keys, EphemeralKeyPair, MessageEnvelope};
//!
//! let alice = EphemeralKeyPair::generate().unwrap();
//! let bob = EphemeralKeyPair::generate().unwrap();
//!
//! let alice_keys = derive_session_keys(
//!     &alice.compute_shared_secret(&bob.public_key_bytes()).unwrap(),
//! );
//! let bob_keys = derive_session_keys(
//!     &bob.compute_shared_secret(&alice.public_key_bytes()).unwrap(),
//! );
//!
//! let envelope = MessageEnvelope::seal(&bob_keys, "bob", b"hello").unwrap();
//! let message = envelope.open(&alice_keys).unwrap();
//! assert_eq!(message.plaintext, "hello");
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: transport text and canonical envelope bytes
//! - [`keys`]: ephemeral key pairs and ECDH
//! - [`kdf`]: session key derivation
//! - [`cipher`]: payload encryption
//! - [`auth`]: envelope MACs
//! - [`envelope`]: envelopes and wire events
//! - [`validation`]: checks on untrusted input and replay protection
//! - [`channel`]: the channel state machine
//! - [`error`]: error types

pub mod auth;
pub mod channel;
pub mod cipher;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod validation;

pub use channel::{
    BoxFuture, ChannelConfig, ChannelEvent, ChannelState, SecureChannel, Transport,
};
pub use codec::{canonicalize, decode_binary, encode_binary, CanonicalFields};
pub use envelope::{
    unix_timestamp, Ack, KeyOffer, MessageEnvelope, PeerEvent, ReceivedMessage, VerifiedEnvelope,
};
pub use error::{ErrorClass, ProtocolError, Result};
pub use kdf::{derive_session_keys, AuthKey, EncryptionKey, SessionKeys};
pub use keys::{key_fingerprint, EphemeralKeyPair, SharedSecret, PUBLIC_KEY_LENGTH};
pub use validation::{is_valid_display_name, validate_envelope_shape, ReplayGuard};
