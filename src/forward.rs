//! # Forwarding Protocol
//!
//! Best-effort delivery of transaction and event batches to every connected
//! validator, one fresh stream per peer per batch.
//!
//! ## Outbound
//!
//! ```text
//! batch ──encode once──► payload
//!                          ├──► peer 1: open stream → acquire(len) → copy → write → finish
//!                          ├──► peer 2: ...
//!                          └──► peer N: ...
//! ```
//!
//! Each peer runs on its own task under a deadline. A failure (no connection,
//! stream open, reservation, write, deadline) is logged and counted; it never
//! stops the other peers and never reaches the caller as an error.
//!
//! ## Inbound
//!
//! [`TxsHandler`] and [`EventsHandler`] reserve their maximum message size
//! (`MAX_MESSAGE_SIZE` unless configured lower), read one
//! message until the sender finishes, decode it, and pass the batch to the
//! [`GossipSink`]. Nothing is written back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::messages::{decode_batch, EventPayload, EventPayloads, Transaction, Transactions, MAX_MESSAGE_SIZE};
use crate::peers::PeerHandle;
use crate::protocols::{GossipSink, StreamHandler};
use crate::scope::ServiceScope;
use crate::transport::{Host, MeshStream};

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub delivered: usize,
    pub failed: usize,
}

impl ForwardReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Send `payload` on `protocol` to every peer except the local identity.
pub(crate) async fn fan_out(
    host: &Arc<Host>,
    scope: &ServiceScope,
    protocol: &'static str,
    payload: Arc<Vec<u8>>,
    deadline: Duration,
) -> ForwardReport {
    let local = host.identity();
    let mut tasks = JoinSet::new();

    for peer in host.peers().snapshot() {
        if peer.identity == local {
            continue;
        }
        let host = Arc::clone(host);
        let scope = scope.clone();
        let payload = Arc::clone(&payload);
        tasks.spawn(async move {
            let identity = peer.identity;
            match tokio::time::timeout(deadline, send_one(&host, &scope, &peer, protocol, &payload)).await {
                Ok(Ok(())) => {
                    trace!(peer = %identity.short(), protocol, bytes = payload.len(), "forwarded");
                    true
                }
                Ok(Err(e)) => {
                    warn!(peer = %identity.short(), protocol, error = %e, "forwarding failed");
                    false
                }
                Err(_) => {
                    warn!(peer = %identity.short(), protocol, ?deadline, "forwarding timed out");
                    false
                }
            }
        });
    }

    let mut report = ForwardReport::default();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(true) => report.delivered += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                warn!(error = %e, "forwarding task failed");
                report.failed += 1;
            }
        }
    }
    debug!(
        protocol,
        delivered = report.delivered,
        failed = report.failed,
        "fan-out complete"
    );
    report
}

async fn send_one(
    host: &Host,
    scope: &ServiceScope,
    peer: &PeerHandle,
    protocol: &str,
    payload: &[u8],
) -> Result<()> {
    let mut stream = host.open_stream(peer, protocol).await?;
    let mut buf = scope.acquire(payload.len())?;
    buf.copy_from_slice(payload);
    stream.write_all(&buf).await?;
    stream.finish()?;
    drop(buf);
    Ok(())
}

/// Scoped read and decode of exactly one batch.
async fn read_batch<T: DeserializeOwned>(
    scope: &ServiceScope,
    stream: &mut MeshStream,
    read_timeout: Duration,
    max_message_size: usize,
) -> Result<Vec<T>> {
    let mut buf = scope.acquire(max_message_size)?;
    let len = tokio::time::timeout(read_timeout, stream.read_to_end_into(&mut buf))
        .await
        .context("message read timed out")??;
    let batch = decode_batch(&buf[..len]).context("failed to decode batch")?;
    stream.close();
    Ok(batch)
}

/// Inbound handler for the transactions channel.
pub struct TxsHandler {
    scope: ServiceScope,
    gossip: Arc<dyn GossipSink>,
    read_timeout: Duration,
    max_message_size: usize,
}

impl TxsHandler {
    pub fn new(scope: ServiceScope, gossip: Arc<dyn GossipSink>, read_timeout: Duration) -> Self {
        Self {
            scope,
            gossip,
            read_timeout,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Cap inbound messages below `MAX_MESSAGE_SIZE`.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size.min(MAX_MESSAGE_SIZE);
        self
    }
}

#[async_trait]
impl StreamHandler for TxsHandler {
    async fn handle(&self, mut stream: MeshStream) {
        let peer = stream.peer();
        match read_batch::<Transaction>(&self.scope, &mut stream, self.read_timeout, self.max_message_size).await {
            Ok(txs) => {
                debug!(peer = %peer.short(), count = txs.len(), "received transactions");
                self.gossip.handle_validator_txs(txs);
            }
            Err(e) => {
                warn!(peer = %peer.short(), protocol = stream.protocol(), error = %e, "discarding transactions message");
                stream.reset();
            }
        }
    }
}

/// Inbound handler for the events channel.
pub struct EventsHandler {
    scope: ServiceScope,
    gossip: Arc<dyn GossipSink>,
    read_timeout: Duration,
    max_message_size: usize,
}

impl EventsHandler {
    pub fn new(scope: ServiceScope, gossip: Arc<dyn GossipSink>, read_timeout: Duration) -> Self {
        Self {
            scope,
            gossip,
            read_timeout,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Cap inbound messages below `MAX_MESSAGE_SIZE`.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size.min(MAX_MESSAGE_SIZE);
        self
    }
}

#[async_trait]
impl StreamHandler for EventsHandler {
    async fn handle(&self, mut stream: MeshStream) {
        let peer = stream.peer();
        match read_batch::<EventPayload>(&self.scope, &mut stream, self.read_timeout, self.max_message_size).await {
            Ok(events) => {
                debug!(peer = %peer.short(), count = events.len(), "received events");
                self.gossip.handle_validator_events(events);
            }
            Err(e) => {
                warn!(peer = %peer.short(), protocol = stream.protocol(), error = %e, "discarding events message");
                stream.reset();
            }
        }
    }
}

// ============================================================================
// Channel-backed gossip sink
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipDelivery {
    Events(EventPayloads),
    Txs(Transactions),
}

/// [`GossipSink`] that queues batches on a bounded channel. Batches that do
/// not fit are dropped with a warning.
#[derive(Clone, Debug)]
pub struct GossipChannel {
    tx: mpsc::Sender<GossipDelivery>,
}

impl GossipChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GossipDelivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn deliver(&self, delivery: GossipDelivery) {
        if let Err(e) = self.tx.try_send(delivery) {
            warn!(error = %e, "gossip queue rejected batch");
        }
    }
}

impl GossipSink for GossipChannel {
    fn handle_validator_events(&self, events: EventPayloads) {
        self.deliver(GossipDelivery::Events(events));
    }

    fn handle_validator_txs(&self, txs: Transactions) {
        self.deliver(GossipDelivery::Txs(txs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ValidatorId;

    #[test]
    fn report_counts_attempts() {
        let report = ForwardReport { delivered: 2, failed: 1 };
        assert_eq!(report.attempted(), 3);
        assert_eq!(ForwardReport::default().attempted(), 0);
    }

    #[tokio::test]
    async fn gossip_channel_delivers_in_order() {
        let (sink, mut rx) = GossipChannel::new(4);
        sink.handle_validator_txs(vec![Transaction::new(1, b"a".to_vec())]);
        sink.handle_validator_events(vec![EventPayload::new(ValidatorId(1), 1, b"e".to_vec())]);

        assert!(matches!(rx.recv().await, Some(GossipDelivery::Txs(t)) if t.len() == 1));
        assert!(matches!(rx.recv().await, Some(GossipDelivery::Events(e)) if e[0].seq == 1));
    }

    #[test]
    fn gossip_channel_drops_when_full() {
        let (sink, mut rx) = GossipChannel::new(1);
        sink.handle_validator_txs(Vec::new());
        sink.handle_validator_txs(vec![Transaction::new(9, Vec::new())]);

        assert_eq!(rx.try_recv().ok(), Some(GossipDelivery::Txs(Vec::new())));
        assert!(rx.try_recv().is_err());
    }
}
