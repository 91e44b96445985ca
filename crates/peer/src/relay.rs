//! In-process relay for a two-member chat room.
//!
//! The relay forwards public keys and sealed envelopes between members and
//! never holds session keys. It applies the same admission checks a hosted
//! relay would: display names, public key shape, envelope shape and size,
//! a per-room replay cache, and refusing messages from a member that has not
//! announced an established channel.
//!
//! Each member's last published key is kept so a member that joins later
//! still receives it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use securechat_protocol::channel::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REPLAY_CACHE_SIZE, DEFAULT_REPLAY_WINDOW,
};
use securechat_protocol::validation::validate_public_key_text;
use securechat_protocol::{
    is_valid_display_name, unix_timestamp, validate_envelope_shape, Ack, BoxFuture, KeyOffer,
    MessageEnvelope, PeerEvent, ProtocolError, ReplayGuard, Transport,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Members allowed in a room.
pub const ROOM_CAPACITY: usize = 2;

/// Default capacity of each member's inbound queue.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Errors returned when joining a room.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The display name is not 3-20 letters, digits or underscores.
    #[error("invalid display name: {0:?}")]
    InvalidName(String),

    /// The room already has two members.
    #[error("room is full")]
    RoomFull,

    /// Another member already uses this name.
    #[error("display name already in use: {0}")]
    NameTaken(String),
}

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Largest accepted ciphertext in bytes.
    pub max_message_size: usize,
    /// Tolerated clock skew for envelope timestamps.
    pub replay_window: Duration,
    /// Envelope ids remembered per room.
    pub replay_cache_size: usize,
    /// Capacity of each member's inbound queue.
    pub inbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            replay_window: DEFAULT_REPLAY_WINDOW,
            replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Sets the largest accepted ciphertext.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the replay window.
    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }

    /// Sets the number of remembered envelope ids.
    pub fn with_replay_cache_size(mut self, size: usize) -> Self {
        self.replay_cache_size = size;
        self
    }

    /// Sets the inbound queue capacity.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }
}

struct Member {
    inbox: mpsc::Sender<PeerEvent>,
    public_key: Option<KeyOffer>,
    /// Set by `announce_ready`. Kept across key republication.
    ready: bool,
}

struct Room {
    members: HashMap<String, Member>,
    replay: ReplayGuard,
}

impl Room {
    fn others(&self, name: &str) -> Vec<mpsc::Sender<PeerEvent>> {
        self.members
            .iter()
            .filter(|(member, _)| member.as_str() != name)
            .map(|(_, member)| member.inbox.clone())
            .collect()
    }
}

/// A single chat room shared by up to two members.
#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    room: Arc<Mutex<Room>>,
}

impl Relay {
    /// Creates an empty room.
    pub fn new(config: RelayConfig) -> Self {
        let replay = ReplayGuard::new(config.replay_window, config.replay_cache_size);
        Self {
            config,
            room: Arc::new(Mutex::new(Room {
                members: HashMap::new(),
                replay,
            })),
        }
    }

    /// Returns the relay settings.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Adds a member and returns its transport and inbound event stream.
    ///
    /// Public keys already published by other members are queued on the new
    /// member's stream before anything else.
    pub async fn join(
        &self,
        name: &str,
    ) -> Result<(RelayEndpoint, mpsc::Receiver<PeerEvent>), RelayError> {
        if !is_valid_display_name(name) {
            return Err(RelayError::InvalidName(name.to_string()));
        }

        let mut room = self.room.lock().await;
        if room.members.contains_key(name) {
            return Err(RelayError::NameTaken(name.to_string()));
        }
        if room.members.len() >= ROOM_CAPACITY {
            return Err(RelayError::RoomFull);
        }

        let (inbox, inbound) = mpsc::channel(self.config.inbox_capacity.max(ROOM_CAPACITY));
        for offer in room.members.values().filter_map(|m| m.public_key.clone()) {
            debug!("Replaying public key of {} to {}", offer.sender, name);
            // The queue is fresh and larger than the member count.
            let _ = inbox.try_send(PeerEvent::PublicKey(offer));
        }

        room.members.insert(
            name.to_string(),
            Member {
                inbox,
                public_key: None,
                ready: false,
            },
        );
        info!("Peer joined: {}", name);

        Ok((
            RelayEndpoint {
                name: name.to_string(),
                relay: self.clone(),
            },
            inbound,
        ))
    }

    /// Removes a member and tells the others it left.
    ///
    /// The others' stored keys are dropped with it, since their channels
    /// reset on the departure.
    ///
    /// Returns `false` if no member had this name.
    pub async fn leave(&self, name: &str) -> bool {
        let recipients = {
            let mut room = self.room.lock().await;
            if room.members.remove(name).is_none() {
                return false;
            }
            // Remaining members discard their keys when the peer leaves.
            for member in room.members.values_mut() {
                member.public_key = None;
                member.ready = false;
            }
            room.others(name)
        };

        info!("Peer left: {}", name);
        for inbox in recipients {
            Self::deliver(
                &inbox,
                PeerEvent::Disconnected {
                    peer: name.to_string(),
                },
            );
        }
        true
    }

    /// Returns the current members, sorted by name.
    pub async fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self.room.lock().await.members.keys().cloned().collect();
        names.sort();
        names
    }

    async fn publish_key(&self, from: &str, offer: KeyOffer) -> Result<Ack, ProtocolError> {
        if offer.sender != from {
            warn!("Key offer from {} claims sender {}", from, offer.sender);
            return Ok(Ack::rejected("sender does not match connection"));
        }
        if let Err(e) = validate_public_key_text(&offer.public_key) {
            warn!("Rejecting public key from {}: {}", from, e);
            return Ok(Ack::rejected("invalid public key"));
        }

        let recipients = {
            let mut room = self.room.lock().await;
            let member = room
                .members
                .get_mut(from)
                .ok_or_else(|| ProtocolError::ConnectionClosed(format!("{} is not in the room", from)))?;
            member.public_key = Some(offer.clone());
            room.others(from)
        };

        debug!("Forwarding public key of {} to {} member(s)", from, recipients.len());
        for inbox in recipients {
            Self::deliver(&inbox, PeerEvent::PublicKey(offer.clone()));
        }
        Ok(Ack::accepted())
    }

    async fn send_envelope(
        &self,
        from: &str,
        envelope: MessageEnvelope,
    ) -> Result<Ack, ProtocolError> {
        let recipients = {
            let mut room = self.room.lock().await;
            let member = room
                .members
                .get(from)
                .ok_or_else(|| ProtocolError::ConnectionClosed(format!("{} is not in the room", from)))?;

            if !member.ready {
                return Ok(Ack::rejected("encryption not established"));
            }
            if envelope.sender != from {
                return Ok(Ack::rejected("sender does not match connection"));
            }
            if let Err(e) = validate_envelope_shape(&envelope, self.config.max_message_size) {
                warn!("Rejecting envelope from {}: {}", from, e);
                return Ok(Ack::rejected(e.to_string()));
            }
            if let Err(e) = room
                .replay
                .check(&envelope.id, envelope.timestamp, unix_timestamp())
            {
                warn!("Rejecting envelope from {}: {}", from, e);
                return Ok(Ack::rejected(e.to_string()));
            }
            room.others(from)
        };

        debug!("Relaying envelope {} from {}", envelope.id, from);
        for inbox in recipients {
            Self::deliver(&inbox, PeerEvent::Envelope(envelope.clone()));
        }
        Ok(Ack::accepted())
    }

    async fn announce_ready(&self, from: &str) -> Result<(), ProtocolError> {
        let mut room = self.room.lock().await;
        let member = room
            .members
            .get_mut(from)
            .ok_or_else(|| ProtocolError::ConnectionClosed(format!("{} is not in the room", from)))?;
        member.ready = true;
        debug!("{} announced an established channel", from);
        Ok(())
    }

    /// Queues an event without waiting. A full or closed queue drops it.
    fn deliver(inbox: &mpsc::Sender<PeerEvent>, event: PeerEvent) {
        if let Err(e) = inbox.try_send(event) {
            warn!("Dropping relayed event: {}", e);
        }
    }
}

/// A member's connection to the relay.
#[derive(Clone)]
pub struct RelayEndpoint {
    name: String,
    relay: Relay,
}

impl RelayEndpoint {
    /// Returns the member's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leaves the room.
    pub async fn leave(&self) -> bool {
        self.relay.leave(&self.name).await
    }
}

impl Transport for RelayEndpoint {
    fn publish_key(&self, offer: KeyOffer) -> BoxFuture<'_, Result<Ack, ProtocolError>> {
        Box::pin(self.relay.publish_key(&self.name, offer))
    }

    fn send_envelope(
        &self,
        envelope: MessageEnvelope,
    ) -> BoxFuture<'_, Result<Ack, ProtocolError>> {
        Box::pin(self.relay.send_envelope(&self.name, envelope))
    }

    fn announce_ready(&self) -> BoxFuture<'_, Result<(), ProtocolError>> {
        Box::pin(self.relay.announce_ready(&self.name))
    }
}
