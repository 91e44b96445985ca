//! Drives a channel from its inbound event stream.
//!
//! A peer's relay connection yields [`PeerEvent`]s. The runner feeds them to
//! the channel one at a time, in arrival order, until the stream closes or
//! shutdown is requested. Failures are logged and the loop keeps going; the
//! channel itself reports them to subscribers.

use std::sync::Arc;

use securechat_protocol::{ErrorClass, PeerEvent, ProtocolError, SecureChannel, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported when a runner stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Events handled without error.
    pub handled: u64,
    /// Events whose handling failed.
    pub failed: u64,
}

/// Event loop for one channel.
pub struct PeerRunner<T: Transport> {
    channel: Arc<SecureChannel<T>>,
    inbound: mpsc::Receiver<PeerEvent>,
    shutdown: CancellationToken,
}

impl<T: Transport + 'static> PeerRunner<T> {
    /// Creates a runner. Nothing happens until [`run`](Self::run) or
    /// [`spawn`](Self::spawn).
    pub fn new(
        channel: Arc<SecureChannel<T>>,
        inbound: mpsc::Receiver<PeerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channel,
            inbound,
            shutdown,
        }
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> JoinHandle<RunnerStats> {
        tokio::spawn(self.run())
    }

    /// Handles events until the stream closes or the token is cancelled.
    pub async fn run(mut self) -> RunnerStats {
        let name = self.channel.config().display_name.clone();
        let mut stats = RunnerStats::default();
        debug!("Runner for {} started", name);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Runner for {} received shutdown signal", name);
                    break;
                }
                event = self.inbound.recv() => {
                    let Some(event) = event else {
                        debug!("Inbound stream for {} closed", name);
                        break;
                    };
                    match self.channel.handle_event(event).await {
                        Ok(()) => stats.handled += 1,
                        Err(e) => {
                            stats.failed += 1;
                            log_failure(&name, &e);
                        }
                    }
                }
            }
        }

        debug!(
            "Runner for {} stopped: {} handled, {} failed",
            name, stats.handled, stats.failed
        );
        stats
    }
}

fn log_failure(name: &str, error: &ProtocolError) {
    match (error, error.class()) {
        (ProtocolError::StaleOperation(_), _) => {
            debug!("{}: discarded stale work: {}", name, error)
        }
        (_, ErrorClass::PerMessage) => warn!("{}: dropped inbound message: {}", name, error),
        (_, ErrorClass::FatalToChannel) => warn!("{}: channel reset: {}", name, error),
        (_, ErrorClass::Transport) => warn!("{}: transport error: {}", name, error),
        (_, ErrorClass::ProgrammerError) => error!("{}: {}", name, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use securechat_protocol::{
        Ack, BoxFuture, ChannelConfig, ChannelState, EphemeralKeyPair, KeyOffer, MessageEnvelope,
    };
    use std::time::Duration;

    /// Transport that accepts everything and delivers nowhere.
    struct SinkTransport;

    impl Transport for SinkTransport {
        fn publish_key(&self, _offer: KeyOffer) -> BoxFuture<'_, Result<Ack, ProtocolError>> {
            Box::pin(async { Ok(Ack::accepted()) })
        }

        fn send_envelope(
            &self,
            _envelope: MessageEnvelope,
        ) -> BoxFuture<'_, Result<Ack, ProtocolError>> {
            Box::pin(async { Ok(Ack::accepted()) })
        }

        fn announce_ready(&self) -> BoxFuture<'_, Result<(), ProtocolError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn channel() -> Arc<SecureChannel<SinkTransport>> {
        Arc::new(SecureChannel::new(ChannelConfig::new("alice"), SinkTransport).unwrap())
    }

    #[tokio::test]
    async fn test_runner_stops_when_stream_closes() {
        let (tx, rx) = mpsc::channel(8);
        let runner = PeerRunner::new(channel(), rx, CancellationToken::new());
        drop(tx);

        let stats = runner.run().await;
        assert_eq!(stats, RunnerStats::default());
    }

    #[tokio::test]
    async fn test_runner_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let handle = PeerRunner::new(channel(), rx, token.clone()).spawn();

        token.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner did not stop")
            .unwrap();
        assert_eq!(stats.handled, 0);
    }

    #[tokio::test]
    async fn test_runner_applies_peer_key() {
        let (tx, rx) = mpsc::channel(8);
        let alice = channel();
        let runner = PeerRunner::new(alice.clone(), rx, CancellationToken::new());

        let bob = EphemeralKeyPair::generate().unwrap();
        tx.send(PeerEvent::PublicKey(KeyOffer::new("bob", bob.public_key_text())))
            .await
            .unwrap();
        drop(tx);

        let stats = runner.run().await;
        assert_eq!(stats.handled, 1);
        assert_eq!(alice.state().await, ChannelState::Ready);
        assert_eq!(alice.peer_name().await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_runner_continues_after_failure() {
        let (tx, rx) = mpsc::channel(8);
        let alice = channel();
        let runner = PeerRunner::new(alice.clone(), rx, CancellationToken::new());

        tx.send(PeerEvent::PublicKey(KeyOffer::new("bob", "garbage")))
            .await
            .unwrap();
        let bob = EphemeralKeyPair::generate().unwrap();
        tx.send(PeerEvent::PublicKey(KeyOffer::new("bob", bob.public_key_text())))
            .await
            .unwrap();
        drop(tx);

        let stats = runner.run().await;
        assert_eq!(stats, RunnerStats { handled: 1, failed: 1 });
        assert!(alice.is_ready().await);
    }

    #[tokio::test]
    async fn test_runner_handles_disconnect() {
        let (tx, rx) = mpsc::channel(8);
        let alice = channel();
        let runner = PeerRunner::new(alice.clone(), rx, CancellationToken::new());

        let bob = EphemeralKeyPair::generate().unwrap();
        tx.send(PeerEvent::PublicKey(KeyOffer::new("bob", bob.public_key_text())))
            .await
            .unwrap();
        tx.send(PeerEvent::Disconnected {
            peer: "bob".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        let stats = runner.run().await;
        assert_eq!(stats.handled, 2);
        assert_eq!(alice.state().await, ChannelState::Idle);
        assert!(alice.public_key_text().await.is_none());
    }
}
