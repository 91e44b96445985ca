//! Local two-peer session.
//!
//! Starts `alice` and `bob` on an in-process relay, establishes keys,
//! exchanges the given messages in alternating directions, then has `bob`
//! leave so `alice` returns to `Idle`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use securechat_protocol::{
    decode_binary, key_fingerprint, ChannelEvent, ChannelState, ReceivedMessage, SecureChannel,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::relay::{Relay, RelayEndpoint};
use crate::runner::{PeerRunner, RunnerStats};

/// Names of the two demo peers.
pub const DEMO_PEERS: [&str; 2] = ["alice", "bob"];

/// What happened during a demo session.
#[derive(Debug, Clone)]
pub struct DemoReport {
    /// Public key fingerprint of each peer, in [`DEMO_PEERS`] order.
    pub fingerprints: [String; 2],
    /// Messages as received by the other side.
    pub delivered: Vec<ReceivedMessage>,
    /// State of `alice` after `bob` left.
    pub final_state: ChannelState,
    /// Runner counters, in [`DEMO_PEERS`] order.
    pub runner_stats: [RunnerStats; 2],
}

struct DemoPeer {
    channel: Arc<SecureChannel<RelayEndpoint>>,
    events: broadcast::Receiver<ChannelEvent>,
}

impl DemoPeer {
    async fn fingerprint(&self) -> Result<String> {
        let text = self
            .channel
            .public_key_text()
            .await
            .context("channel has no public key")?;
        Ok(key_fingerprint(&decode_binary(&text)?))
    }
}

/// Runs a demo session with the given messages.
pub async fn run_demo(config: &Config, messages: &[String]) -> Result<DemoReport> {
    let relay = Relay::new(config.relay_config());
    let shutdown = CancellationToken::new();
    let limit = Duration::from_secs(config.channel.key_exchange_timeout);

    let mut peers = Vec::with_capacity(DEMO_PEERS.len());
    let mut runners = Vec::with_capacity(DEMO_PEERS.len());
    for name in DEMO_PEERS {
        let (endpoint, inbound) = relay.join(name).await?;
        let channel = Arc::new(SecureChannel::new(
            config.channel_config_for(name),
            endpoint,
        )?);
        let events = channel.subscribe();
        runners.push(PeerRunner::new(channel.clone(), inbound, shutdown.child_token()).spawn());
        peers.push(DemoPeer { channel, events });
    }

    info!("Starting key exchange");
    peers[0].channel.connect().await?;
    for peer in peers.iter_mut() {
        let peer_name = wait_for(&mut peer.events, limit, |event| match event {
            ChannelEvent::Ready { peer } => Some(peer.clone()),
            _ => None,
        })
        .await
        .context("key exchange did not complete")?;
        info!(
            "{} is ready with {}",
            peer.channel.config().display_name,
            peer_name
        );
    }

    let fingerprints = [peers[0].fingerprint().await?, peers[1].fingerprint().await?];

    let send_limit = Duration::from_secs(config.channel.send_timeout);
    let mut delivered = Vec::with_capacity(messages.len());
    for (i, text) in messages.iter().enumerate() {
        let (from, to) = if i % 2 == 0 { (0, 1) } else { (1, 0) };
        peers[from].channel.send(text).await?;
        let message = wait_for(&mut peers[to].events, send_limit, |event| match event {
            ChannelEvent::MessageReceived(message) => Some(message.clone()),
            _ => None,
        })
        .await
        .context("message was not delivered")?;
        delivered.push(message);
    }

    info!("{} leaving", DEMO_PEERS[1]);
    relay.leave(DEMO_PEERS[1]).await;
    peers[1].channel.disconnect().await;
    wait_for(&mut peers[0].events, limit, |event| match event {
        ChannelEvent::StateChanged(ChannelState::Idle) => Some(()),
        _ => None,
    })
    .await
    .context("channel did not return to idle")?;
    let final_state = peers[0].channel.state().await;

    shutdown.cancel();
    let mut runner_stats = [RunnerStats::default(); 2];
    for (slot, handle) in runner_stats.iter_mut().zip(runners) {
        *slot = handle.await.context("runner task failed")?;
    }

    Ok(DemoReport {
        fingerprints,
        delivered,
        final_state,
        runner_stats,
    })
}

/// Waits for the first event `pick` accepts.
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<ChannelEvent>,
    limit: Duration,
    mut pick: impl FnMut(&ChannelEvent) -> Option<T>,
) -> Result<T> {
    match tokio::time::timeout(limit, next_match(events, &mut pick)).await {
        Ok(result) => result,
        Err(_) => bail!("timed out after {:?}", limit),
    }
}

async fn next_match<T>(
    events: &mut broadcast::Receiver<ChannelEvent>,
    pick: &mut impl FnMut(&ChannelEvent) -> Option<T>,
) -> Result<T> {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(found) = pick(&event) {
                    return Ok(found);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Event stream lagged, skipped {}", skipped);
            }
            Err(RecvError::Closed) => bail!("event stream closed"),
        }
    }
}
