//! End-to-end integration tests for SecureChat.
//!
//! These tests run real channels over the in-process relay:
//! - Key exchange in either join order
//! - Message delivery in both directions
//! - Rejection of tampered and replayed envelopes
//! - Peer departure and renegotiation with a new peer

use std::sync::Arc;
use std::time::Duration;

use securechat_peer::demo::wait_for;
use securechat_peer::relay::{Relay, RelayConfig, RelayEndpoint};
use securechat_peer::runner::{PeerRunner, RunnerStats};
use securechat_protocol::{
    decode_binary, encode_binary, ChannelConfig, ChannelEvent, ChannelState, ErrorClass,
    ProtocolError, ReceivedMessage, SecureChannel,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LIMIT: Duration = Duration::from_secs(5);

struct Peer {
    channel: Arc<SecureChannel<RelayEndpoint>>,
    events: broadcast::Receiver<ChannelEvent>,
    runner: JoinHandle<RunnerStats>,
}

impl Peer {
    async fn start(relay: &Relay, name: &str, shutdown: &CancellationToken) -> Self {
        let (endpoint, inbound) = relay.join(name).await.unwrap();
        let channel = Arc::new(SecureChannel::new(ChannelConfig::new(name), endpoint).unwrap());
        let events = channel.subscribe();
        let runner = PeerRunner::new(channel.clone(), inbound, shutdown.child_token()).spawn();
        Self {
            channel,
            events,
            runner,
        }
    }

    async fn wait_ready(&mut self) -> String {
        wait_for(&mut self.events, LIMIT, |event| match event {
            ChannelEvent::Ready { peer } => Some(peer.clone()),
            _ => None,
        })
        .await
        .unwrap()
    }

    async fn wait_message(&mut self) -> ReceivedMessage {
        wait_for(&mut self.events, LIMIT, |event| match event {
            ChannelEvent::MessageReceived(message) => Some(message.clone()),
            _ => None,
        })
        .await
        .unwrap()
    }

    async fn wait_idle(&mut self) {
        wait_for(&mut self.events, LIMIT, |event| match event {
            ChannelEvent::StateChanged(ChannelState::Idle) => Some(()),
            _ => None,
        })
        .await
        .unwrap()
    }
}

/// Joins alice and bob, has alice start the exchange and waits until both
/// are ready.
async fn establish(relay: &Relay, shutdown: &CancellationToken) -> (Peer, Peer) {
    let mut alice = Peer::start(relay, "alice", shutdown).await;
    let mut bob = Peer::start(relay, "bob", shutdown).await;

    alice.channel.connect().await.unwrap();
    assert_eq!(alice.wait_ready().await, "bob");
    assert_eq!(bob.wait_ready().await, "alice");
    (alice, bob)
}

// =============================================================================
// Key Exchange Tests
// =============================================================================

#[tokio::test]
async fn test_hello_scenario() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (alice, mut bob) = establish(&relay, &shutdown).await;

    let sent = alice.channel.send("hello").await.unwrap();
    let received = bob.wait_message().await;

    assert_eq!(received.plaintext, "hello");
    assert_eq!(received.sender, "alice");
    assert_eq!(received.id, sent.id);
    assert_eq!(received.timestamp, sent.timestamp);

    // Nothing on the wire carries the plaintext.
    let wire = sent.to_json().unwrap();
    assert!(!wire.contains("hello"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_late_joiner_receives_stored_key() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();

    let mut alice = Peer::start(&relay, "alice", &shutdown).await;
    alice.channel.connect().await.unwrap();
    assert_eq!(alice.channel.state().await, ChannelState::AwaitingPeerKey);

    let mut bob = Peer::start(&relay, "bob", &shutdown).await;
    assert_eq!(bob.wait_ready().await, "alice");
    assert_eq!(alice.wait_ready().await, "bob");

    bob.channel.send("you were first").await.unwrap();
    assert_eq!(alice.wait_message().await.plaintext, "you were first");

    shutdown.cancel();
}

#[tokio::test]
async fn test_simultaneous_connect_converges() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let mut alice = Peer::start(&relay, "alice", &shutdown).await;
    let mut bob = Peer::start(&relay, "bob", &shutdown).await;

    let (a, b) = tokio::join!(alice.channel.connect(), bob.channel.connect());
    a.unwrap();
    // bob may already have answered alice's key by the time it connects.
    if let Err(e) = b {
        assert!(matches!(e, ProtocolError::InvalidTransition { .. }));
    }

    alice.wait_ready().await;
    bob.wait_ready().await;

    alice.channel.send("ping").await.unwrap();
    assert_eq!(bob.wait_message().await.plaintext, "ping");
    bob.channel.send("pong").await.unwrap();
    assert_eq!(alice.wait_message().await.plaintext, "pong");

    shutdown.cancel();
}

#[tokio::test]
async fn test_send_before_ready_fails() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let alice = Peer::start(&relay, "alice", &shutdown).await;

    let result = alice.channel.send("too early").await;
    assert!(matches!(result, Err(ProtocolError::EncryptionUnavailable)));

    alice.channel.connect().await.unwrap();
    let result = alice.channel.send("still too early").await;
    assert!(matches!(result, Err(ProtocolError::EncryptionUnavailable)));

    shutdown.cancel();
}

// =============================================================================
// Message Integrity Tests
// =============================================================================

#[tokio::test]
async fn test_tampered_envelope_rejected_and_channel_survives() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (alice, mut bob) = establish(&relay, &shutdown).await;

    let sent = alice.channel.send("original").await.unwrap();
    assert_eq!(bob.wait_message().await.plaintext, "original");

    let mut tampered = sent.clone();
    tampered.id = "tampered-copy".to_string();
    let mut ciphertext = decode_binary(&tampered.ciphertext).unwrap();
    ciphertext[0] ^= 0x01;
    tampered.ciphertext = encode_binary(&ciphertext);

    let err = bob.channel.receive(tampered).await.unwrap_err();
    assert!(matches!(err, ProtocolError::MacMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::PerMessage);

    let class = wait_for(&mut bob.events, LIMIT, |event| match event {
        ChannelEvent::Failure { class, .. } => Some(*class),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(class, ErrorClass::PerMessage);
    assert!(bob.channel.is_ready().await);

    alice.channel.send("after").await.unwrap();
    assert_eq!(bob.wait_message().await.plaintext, "after");

    shutdown.cancel();
}

#[tokio::test]
async fn test_replayed_envelope_rejected() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (alice, mut bob) = establish(&relay, &shutdown).await;

    let sent = alice.channel.send("once").await.unwrap();
    assert_eq!(bob.wait_message().await.plaintext, "once");

    let result = bob.channel.receive(sent).await;
    assert!(matches!(result, Err(ProtocolError::Replay(_))));
    assert!(bob.channel.is_ready().await);

    shutdown.cancel();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_peer_departure_returns_to_idle() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (mut alice, bob) = establish(&relay, &shutdown).await;

    assert!(bob.channel.transport().leave().await);
    bob.channel.disconnect().await;

    alice.wait_idle().await;
    assert_eq!(alice.channel.state().await, ChannelState::Idle);
    assert!(alice.channel.peer_name().await.is_none());
    assert!(alice.channel.public_key_text().await.is_none());
    assert!(matches!(
        alice.channel.send("anyone?").await,
        Err(ProtocolError::EncryptionUnavailable)
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_new_peer_after_departure_gets_fresh_keys() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (mut alice, bob) = establish(&relay, &shutdown).await;
    let first_key = alice.channel.public_key_text().await.unwrap();

    bob.channel.transport().leave().await;
    alice.wait_idle().await;

    let mut carol = Peer::start(&relay, "carol", &shutdown).await;
    carol.channel.connect().await.unwrap();
    assert_eq!(alice.wait_ready().await, "carol");
    assert_eq!(carol.wait_ready().await, "alice");

    let second_key = alice.channel.public_key_text().await.unwrap();
    assert_ne!(first_key, second_key);

    carol.channel.send("hi alice").await.unwrap();
    let received = alice.wait_message().await;
    assert_eq!(received.sender, "carol");
    assert_eq!(received.plaintext, "hi alice");

    shutdown.cancel();
}

#[tokio::test]
async fn test_runners_stop_on_shutdown() {
    let relay = Relay::new(RelayConfig::default());
    let shutdown = CancellationToken::new();
    let (alice, bob) = establish(&relay, &shutdown).await;

    alice.channel.send("one").await.unwrap();
    shutdown.cancel();

    let alice_stats = tokio::time::timeout(LIMIT, alice.runner).await.unwrap().unwrap();
    let bob_stats = tokio::time::timeout(LIMIT, bob.runner).await.unwrap().unwrap();

    // alice handled bob's key; bob handled alice's key and at most the message.
    assert_eq!(alice_stats.handled, 1);
    assert!(bob_stats.handled >= 1);
    assert_eq!(alice_stats.failed + bob_stats.failed, 0);
}
