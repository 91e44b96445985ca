//! Secure channel state machine.
//!
//! A [`SecureChannel`] owns the ephemeral key pair and session keys for one
//! peer relationship and sequences key exchange and message flow:
//!
//! ```text
//! Idle --connect--> KeyGenerated --ack--> AwaitingPeerKey --peer key--> Ready
//!  ^                                                                     |
//!  +------------------------- Reset <---- disconnect / invalid key ------+
//! ```
//!
//! A channel in `Idle` that receives a peer key takes the responder path: it
//! generates its own key pair, derives keys and publishes its public key in
//! reply.
//!
//! All key material stays inside the channel. The transport only ever sees
//! public keys and sealed envelopes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::codec::encode_binary;
use crate::envelope::{unix_timestamp, Ack, KeyOffer, MessageEnvelope, PeerEvent, ReceivedMessage};
use crate::error::{ErrorClass, ProtocolError, Result};
use crate::kdf::{derive_session_keys, SessionKeys};
use crate::keys::EphemeralKeyPair;
use crate::validation::{
    validate_display_name, validate_envelope_shape, validate_public_key_text, ReplayGuard,
};

/// Default time to wait for a key offer to be acknowledged.
pub const DEFAULT_KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for an envelope to be acknowledged.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default plaintext size limit in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Default tolerated clock skew for incoming envelopes.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Default number of envelope ids remembered for replay detection.
pub const DEFAULT_REPLAY_CACHE_SIZE: usize = 1000;

/// Default capacity of the channel event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No key material. Initial state and the state after any reset.
    Idle,
    /// Local key pair generated, public key being published.
    KeyGenerated,
    /// Public key acknowledged, waiting for the peer's key.
    AwaitingPeerKey,
    /// Session keys derived; messages flow both ways.
    Ready,
    /// Key material being discarded. Always followed by `Idle`.
    Reset,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "Idle",
            ChannelState::KeyGenerated => "KeyGenerated",
            ChannelState::AwaitingPeerKey => "AwaitingPeerKey",
            ChannelState::Ready => "Ready",
            ChannelState::Reset => "Reset",
        };
        f.write_str(name)
    }
}

/// Configuration for a secure channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Local display name, used as the envelope sender.
    pub display_name: String,
    /// Time to wait for a key offer acknowledgement.
    pub key_exchange_timeout: Duration,
    /// Time to wait for an envelope acknowledgement.
    pub send_timeout: Duration,
    /// Largest plaintext accepted by `send`, and largest ciphertext
    /// accepted by `receive`, in bytes.
    pub max_message_size: usize,
    /// Tolerated difference between an envelope timestamp and local time.
    pub replay_window: Duration,
    /// Number of envelope ids remembered for replay detection.
    pub replay_cache_size: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl ChannelConfig {
    /// Creates a configuration with default limits.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            key_exchange_timeout: DEFAULT_KEY_EXCHANGE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            replay_window: DEFAULT_REPLAY_WINDOW,
            replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Sets the key offer acknowledgement timeout.
    pub fn with_key_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.key_exchange_timeout = timeout;
        self
    }

    /// Sets the envelope acknowledgement timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the message size limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the replay window.
    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }

    /// Sets the replay cache size.
    pub fn with_replay_cache_size(mut self, size: usize) -> Self {
        self.replay_cache_size = size;
        self
    }

    /// Sets the event broadcast capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Checks the display name and limits.
    pub fn validate(&self) -> Result<()> {
        validate_display_name(&self.display_name)?;
        if self.max_message_size == 0 {
            return Err(ProtocolError::InvalidEnvelope(
                "max_message_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound half of the signaling layer, as seen by a channel.
///
/// Implementations deliver key offers and envelopes to the peer and report
/// whether the relay accepted them.
pub trait Transport: Send + Sync {
    /// Publishes the local public key to the peer.
    fn publish_key(&self, offer: KeyOffer) -> BoxFuture<'_, Result<Ack>>;

    /// Hands a sealed envelope to the relay for delivery.
    fn send_envelope(&self, envelope: MessageEnvelope) -> BoxFuture<'_, Result<Ack>>;

    /// Tells the relay that encryption is established on this side.
    fn announce_ready(&self) -> BoxFuture<'_, Result<()>>;
}

/// Events emitted by a channel for the user interface.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel moved to a new state.
    StateChanged(ChannelState),
    /// Session keys are established with `peer`.
    Ready {
        /// Display name of the peer.
        peer: String,
    },
    /// A message was authenticated and decrypted.
    MessageReceived(ReceivedMessage),
    /// Something failed. `class` says whether the channel was reset.
    Failure {
        /// How the failure affected the channel.
        class: ErrorClass,
        /// Human-readable description.
        message: String,
    },
}

struct ChannelInner {
    state: ChannelState,
    /// Incremented on every reset. Work started under an older epoch is
    /// discarded when it completes.
    epoch: u64,
    key_pair: Option<EphemeralKeyPair>,
    keys: Option<SessionKeys>,
    peer_key: Option<Vec<u8>>,
    peer_name: Option<String>,
    replay: ReplayGuard,
}

/// End-to-end encrypted channel to a single peer.
pub struct SecureChannel<T: Transport> {
    config: ChannelConfig,
    transport: T,
    inner: Mutex<ChannelInner>,
    event_tx: broadcast::Sender<ChannelEvent>,
    /// Holds key agreement open so tests can interleave a reset.
    #[cfg(test)]
    agreement_delay: Option<Duration>,
}

impl<T: Transport> SecureChannel<T> {
    /// Creates an idle channel.
    pub fn new(config: ChannelConfig, transport: T) -> Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let replay = ReplayGuard::new(config.replay_window, config.replay_cache_size);

        Ok(Self {
            config,
            transport,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Idle,
                epoch: 0,
                key_pair: None,
                keys: None,
                peer_key: None,
                peer_name: None,
                replay,
            }),
            event_tx,
            #[cfg(test)]
            agreement_delay: None,
        })
    }

    /// Subscribes to channel events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the current state.
    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Returns whether session keys are established.
    pub async fn is_ready(&self) -> bool {
        self.state().await == ChannelState::Ready
    }

    /// Returns the peer's display name once keys are established.
    pub async fn peer_name(&self) -> Option<String> {
        self.inner.lock().await.peer_name.clone()
    }

    /// Returns the local public key in transport text, if one exists.
    pub async fn public_key_text(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .key_pair
            .as_ref()
            .map(EphemeralKeyPair::public_key_text)
    }

    /// Starts key exchange: generates a fresh key pair and publishes the
    /// public key.
    ///
    /// Only valid from `Idle`. Returns once the relay has acknowledged the
    /// offer; the channel is then `AwaitingPeerKey` (or already `Ready` if
    /// the peer's key arrived in the meantime).
    pub async fn connect(&self) -> Result<()> {
        let (offer, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.state != ChannelState::Idle {
                return Err(ProtocolError::InvalidTransition {
                    action: "connect",
                    state: inner.state.to_string(),
                });
            }

            let pair = match EphemeralKeyPair::generate() {
                Ok(pair) => pair,
                Err(e) => {
                    self.report(&e);
                    return Err(e);
                }
            };

            let offer = KeyOffer::new(self.config.display_name.clone(), pair.public_key_text());
            inner.key_pair = Some(pair);
            self.set_state(&mut inner, ChannelState::KeyGenerated);
            (offer, inner.epoch)
        };

        info!("Publishing public key for {}", self.config.display_name);
        let published = self.publish(offer).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return Err(ProtocolError::StaleOperation("key publication"));
        }

        match published {
            Ok(()) => {
                if inner.state == ChannelState::KeyGenerated {
                    self.set_state(&mut inner, ChannelState::AwaitingPeerKey);
                }
                Ok(())
            }
            Err(e) => {
                self.abort_exchange(&mut inner, &e);
                Err(e)
            }
        }
    }

    /// Accepts the peer's public key and derives session keys.
    ///
    /// - From `Idle`: generates a key pair, derives, then publishes the local
    ///   public key in reply.
    /// - From `KeyGenerated` or `AwaitingPeerKey`: derives.
    /// - From `Ready` with the same key: ignored.
    /// - From `Ready` with a different key: the peer restarted. The old
    ///   session is reset, then handled as from `Idle` with a fresh key pair.
    ///
    /// An invalid key resets the channel to `Idle`.
    pub async fn handle_peer_key(&self, offer: KeyOffer) -> Result<()> {
        let peer_bytes = match validate_public_key_text(&offer.public_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                self.abort_exchange(&mut inner, &e);
                return Err(e);
            }
        };

        let (pair, epoch, republish) = {
            let mut inner = self.inner.lock().await;
            if inner.state == ChannelState::Ready {
                if inner.peer_key.as_deref() == Some(peer_bytes.as_slice()) {
                    debug!("Ignoring repeated public key from {}", offer.sender);
                    return Ok(());
                }
                info!("Peer {} sent a new public key, renegotiating", offer.sender);
                self.reset_locked(&mut inner);
            }

            let republish = inner.state == ChannelState::Idle;
            if republish {
                let pair = match EphemeralKeyPair::generate() {
                    Ok(pair) => pair,
                    Err(e) => {
                        self.report(&e);
                        return Err(e);
                    }
                };
                inner.key_pair = Some(pair);
                self.set_state(&mut inner, ChannelState::KeyGenerated);
            }

            let Some(pair) = inner.key_pair.clone() else {
                return Err(ProtocolError::InvalidTransition {
                    action: "accept a peer key",
                    state: inner.state.to_string(),
                });
            };
            (pair, inner.epoch, republish)
        };

        debug!("Computing shared secret with {}", offer.sender);
        let local_public = pair.public_key_bytes();
        let peer_point = peer_bytes.clone();
        let derived = tokio::task::spawn_blocking(move || -> Result<SessionKeys> {
            let secret = pair.compute_shared_secret(&peer_point)?;
            Ok(derive_session_keys(&secret))
        })
        .await
        .map_err(|e| ProtocolError::KeyGeneration(format!("key agreement task failed: {}", e)))
        .and_then(|result| result);
        self.agreement_pause().await;

        {
            let mut inner = self.inner.lock().await;
            let current = inner.key_pair.as_ref().map(EphemeralKeyPair::public_key_bytes);
            if inner.epoch != epoch || current.as_deref() != Some(local_public.as_slice()) {
                return Err(ProtocolError::StaleOperation("key agreement"));
            }

            let keys = match derived {
                Ok(keys) => keys,
                Err(e) => {
                    self.abort_exchange(&mut inner, &e);
                    return Err(e);
                }
            };

            inner.keys = Some(keys);
            inner.peer_key = Some(peer_bytes);
            inner.peer_name = Some(offer.sender.clone());
            inner.replay.clear();
            self.set_state(&mut inner, ChannelState::Ready);
        }
        info!("Session keys established with {}", offer.sender);

        if republish {
            let reply = KeyOffer::new(self.config.display_name.clone(), encode_binary(&local_public));
            if let Err(e) = self.publish(reply).await {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    self.abort_exchange(&mut inner, &e);
                }
                return Err(e);
            }
        }

        self.announce_ready(epoch, offer.sender).await
    }

    /// Encrypts, authenticates and sends a message.
    ///
    /// Fails with [`ProtocolError::EncryptionUnavailable`] unless the
    /// channel is `Ready`. Returns the envelope once the relay accepted it.
    pub async fn send(&self, plaintext: &str) -> Result<MessageEnvelope> {
        if plaintext.len() > self.config.max_message_size {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "message is {} bytes, limit is {}",
                plaintext.len(),
                self.config.max_message_size
            )));
        }

        // Sealed under the lock so envelopes are produced in call order.
        let envelope = {
            let inner = self.inner.lock().await;
            match (inner.state, inner.keys.as_ref()) {
                (ChannelState::Ready, Some(keys)) => {
                    MessageEnvelope::seal(keys, &self.config.display_name, plaintext.as_bytes())?
                }
                _ => return Err(ProtocolError::EncryptionUnavailable),
            }
        };

        let ack = Self::await_ack(
            "envelope",
            self.config.send_timeout,
            self.transport.send_envelope(envelope.clone()),
        )
        .await?;

        if !ack.accepted {
            return Err(ProtocolError::DeliveryRejected(
                ack.reason_or_default().to_string(),
            ));
        }

        debug!("Envelope {} delivered", envelope.id);
        Ok(envelope)
    }

    /// Authenticates and decrypts an envelope from the peer.
    ///
    /// The MAC is checked before anything else touches the ciphertext, then
    /// freshness, then decryption. Any failure drops only this envelope;
    /// the channel stays `Ready`.
    pub async fn receive(&self, envelope: MessageEnvelope) -> Result<ReceivedMessage> {
        match self.open_envelope(&envelope).await {
            Ok(message) => {
                debug!("Envelope {} from {} decrypted", message.id, message.sender);
                self.emit(ChannelEvent::MessageReceived(message.clone()));
                Ok(message)
            }
            Err(e) => {
                warn!("Dropping envelope {}: {}", envelope.id, e);
                self.report(&e);
                Err(e)
            }
        }
    }

    async fn open_envelope(&self, envelope: &MessageEnvelope) -> Result<ReceivedMessage> {
        validate_envelope_shape(envelope, self.config.max_message_size)?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let keys = match (inner.state, inner.keys.as_ref()) {
            (ChannelState::Ready, Some(keys)) => keys,
            _ => return Err(ProtocolError::EncryptionUnavailable),
        };

        let verified = envelope.verify(keys)?;
        inner
            .replay
            .check_fresh(&envelope.id, envelope.timestamp, unix_timestamp())?;
        let message = verified.decrypt(keys)?;
        inner.replay.record(&envelope.id);
        Ok(message)
    }

    /// Handles the peer leaving. Keys are discarded and the channel returns
    /// to `Idle`.
    ///
    /// Ignored if `peer` is not the peer this channel is keyed with.
    pub async fn peer_disconnected(&self, peer: &str) {
        let mut inner = self.inner.lock().await;

        if let Some(current) = &inner.peer_name {
            if current != peer {
                debug!("Ignoring disconnect of {}, channel is with {}", peer, current);
                return;
            }
        }
        if inner.state == ChannelState::Idle {
            return;
        }

        info!("Peer {} disconnected, discarding session keys", peer);
        self.reset_locked(&mut inner);
    }

    /// Discards all key material locally and returns to `Idle`.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ChannelState::Idle {
            info!("Closing channel for {}", self.config.display_name);
            self.reset_locked(&mut inner);
        }
    }

    /// Dispatches an inbound transport event.
    pub async fn handle_event(&self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::PublicKey(offer) => self.handle_peer_key(offer).await,
            PeerEvent::Envelope(envelope) => self.receive(envelope).await.map(|_| ()),
            PeerEvent::Disconnected { peer } => {
                self.peer_disconnected(&peer).await;
                Ok(())
            }
        }
    }

    async fn publish(&self, offer: KeyOffer) -> Result<()> {
        let ack = Self::await_ack(
            "key offer",
            self.config.key_exchange_timeout,
            self.transport.publish_key(offer),
        )
        .await?;

        if ack.accepted {
            Ok(())
        } else {
            Err(ProtocolError::KeyExchangeRejected(
                ack.reason_or_default().to_string(),
            ))
        }
    }

    async fn announce_ready(&self, epoch: u64, peer: String) -> Result<()> {
        let announced = match tokio::time::timeout(
            self.config.send_timeout,
            self.transport.announce_ready(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "ready announcement not completed within {:?}",
                self.config.send_timeout
            ))),
        };

        if let Err(e) = announced {
            warn!("Failed to announce readiness: {}", e);
            self.report(&e);
            return Err(e);
        }

        if self.inner.lock().await.epoch != epoch {
            return Err(ProtocolError::StaleOperation("ready announcement"));
        }

        self.emit(ChannelEvent::Ready { peer });
        Ok(())
    }

    async fn await_ack<F>(what: &str, limit: Duration, request: F) -> Result<Ack>
    where
        F: Future<Output = Result<Ack>>,
    {
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "{} not acknowledged within {:?}",
                what, limit
            ))),
        }
    }

    /// Abandons key exchange after a failure and notifies subscribers.
    fn abort_exchange(&self, inner: &mut ChannelInner, error: &ProtocolError) {
        warn!("Key exchange failed: {}", error);
        if inner.state != ChannelState::Idle {
            self.reset_locked(inner);
        }
        self.emit(ChannelEvent::Failure {
            class: ErrorClass::FatalToChannel,
            message: error.to_string(),
        });
    }

    fn reset_locked(&self, inner: &mut ChannelInner) {
        inner.epoch = inner.epoch.wrapping_add(1);
        self.set_state(inner, ChannelState::Reset);

        inner.key_pair = None;
        inner.keys = None;
        inner.peer_key = None;
        inner.peer_name = None;
        inner.replay.clear();

        self.set_state(inner, ChannelState::Idle);
    }

    #[cfg(test)]
    async fn agreement_pause(&self) {
        if let Some(delay) = self.agreement_delay {
            tokio::time::sleep(delay).await;
        }
    }

    #[cfg(not(test))]
    async fn agreement_pause(&self) {}

    fn set_state(&self, inner: &mut ChannelInner, state: ChannelState) {
        if inner.state != state {
            debug!("Channel state {} -> {}", inner.state, state);
            inner.state = state;
            self.emit(ChannelEvent::StateChanged(state));
        }
    }

    fn report(&self, error: &ProtocolError) {
        self.emit(ChannelEvent::Failure {
            class: error.class(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
