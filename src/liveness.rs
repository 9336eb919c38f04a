//! # Liveness Protocol
//!
//! A continuous challenge/echo exchange on one long-lived stream per probe.
//!
//! ```text
//! Idle ──write challenge──► ChallengeSent ──► AwaitingEcho ──echo matches──► Idle
//!                                                  │
//!                                                  └── mismatch / I/O error / cancel ──► Closed
//! ```
//!
//! - Initiator ([`AliveProbe`]): writes `ALIVE_SIZE` random bytes, reads the
//!   echo back, compares, records the round-trip time, and starts the next
//!   round immediately. Any error ends the probe; cancellation resets the
//!   stream.
//! - Responder ([`AliveHandler`]): echoes each block verbatim. The stream is
//!   closed when no block arrives within the idle timeout or on I/O error.
//!
//! Each round reserves its buffer through the service scope and releases it
//! before the next round starts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::LivenessError;
use crate::identity::Identity;
use crate::messages::ALIVE_SIZE;
use crate::protocols::{StreamHandler, VALIDATOR_ALIVE_PROTOCOL};
use crate::scope::ServiceScope;
use crate::transport::{Host, MeshStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    ChallengeSent,
    AwaitingEcho,
    Closed,
}

// ============================================================================
// Responder
// ============================================================================

pub struct AliveHandler {
    scope: ServiceScope,
    idle_timeout: Duration,
}

impl AliveHandler {
    pub fn new(scope: ServiceScope, idle_timeout: Duration) -> Self {
        Self { scope, idle_timeout }
    }
}

#[async_trait]
impl StreamHandler for AliveHandler {
    async fn handle(&self, mut stream: MeshStream) {
        let peer = stream.peer();
        let mut buf = match self.scope.acquire(ALIVE_SIZE) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "liveness stream refused");
                stream.reset();
                return;
            }
        };

        let mut echoed = 0u64;
        loop {
            match tokio::time::timeout(self.idle_timeout, stream.read_exact(&mut buf)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), error = %e, echoed, "liveness stream ended");
                    break;
                }
                Err(_) => {
                    debug!(peer = %peer.short(), echoed, "liveness stream idle, closing");
                    break;
                }
            }
            if let Err(e) = stream.write_all(&buf).await {
                debug!(peer = %peer.short(), error = %e, "liveness echo failed");
                break;
            }
            echoed += 1;
        }

        drop(buf);
        stream.close();
    }
}

// ============================================================================
// Initiator
// ============================================================================

/// A running liveness probe against one peer.
///
/// Rounds are reported through [`next`](Self::next) until the probe ends;
/// the last item is either a terminal error or nothing (after
/// cancellation). Dropping the probe cancels it.
pub struct AliveProbe {
    peer: Identity,
    results: mpsc::UnboundedReceiver<Result<Duration, LivenessError>>,
    cancel: CancellationToken,
    state: watch::Receiver<ProbeState>,
}

impl AliveProbe {
    /// Start probing `peer`. The probe stops when `cancel` (or the probe's own
    /// child token) fires.
    pub(crate) fn spawn(
        host: Arc<Host>,
        scope: ServiceScope,
        peer: Identity,
        cancel: &CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let (results_tx, results) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ProbeState::Idle);

        tokio::spawn(run_probe(host, scope, peer, cancel.clone(), results_tx, state_tx));

        Self {
            peer,
            results,
            cancel,
            state,
        }
    }

    pub fn peer(&self) -> Identity {
        self.peer
    }

    /// Next round's outcome; `None` once the probe has ended.
    pub async fn next(&mut self) -> Option<Result<Duration, LivenessError>> {
        self.results.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ProbeState {
        *self.state.borrow()
    }

    /// Wait until the probe reaches [`ProbeState::Closed`].
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == ProbeState::Closed).await;
    }
}

impl Drop for AliveProbe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AliveProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliveProbe")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_probe(
    host: Arc<Host>,
    scope: ServiceScope,
    peer: Identity,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<Result<Duration, LivenessError>>,
    state: watch::Sender<ProbeState>,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => None,
        r = host.new_stream(&peer, VALIDATOR_ALIVE_PROTOCOL) => Some(r),
    };
    let mut stream = match opened {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            debug!(peer = %peer.short(), error = %e, "failed to open liveness stream");
            let _ = results.send(Err(LivenessError::Stream(e)));
            state.send_replace(ProbeState::Closed);
            return;
        }
        None => {
            state.send_replace(ProbeState::Closed);
            return;
        }
    };

    let mut rng = StdRng::from_entropy();
    let mut rounds = 0u64;
    loop {
        let round = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(peer = %peer.short(), rounds, "liveness probe cancelled");
                break;
            }
            r = ping(&mut stream, &scope, &mut rng, &state) => r,
        };
        match round {
            Ok(rtt) => {
                rounds += 1;
                host.peers().record_latency(peer, rtt);
                state.send_replace(ProbeState::Idle);
                trace!(peer = %peer.short(), ?rtt, "liveness round");
                if results.send(Ok(rtt)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, rounds, "liveness probe failed");
                let _ = results.send(Err(e));
                break;
            }
        }
    }

    stream.reset();
    state.send_replace(ProbeState::Closed);
}

/// One challenge/echo round.
async fn ping(
    stream: &mut MeshStream,
    scope: &ServiceScope,
    rng: &mut StdRng,
    state: &watch::Sender<ProbeState>,
) -> Result<Duration, LivenessError> {
    let mut buf = scope.acquire(2 * ALIVE_SIZE)?;
    let (challenge, echo) = buf.split_at_mut(ALIVE_SIZE);
    rng.fill_bytes(challenge);

    let started = Instant::now();
    state.send_replace(ProbeState::ChallengeSent);
    stream.write_all(challenge).await.map_err(LivenessError::Io)?;
    state.send_replace(ProbeState::AwaitingEcho);
    stream.read_exact(echo).await.map_err(LivenessError::Io)?;
    let rtt = started.elapsed();

    if challenge != echo {
        return Err(LivenessError::PingMismatch);
    }
    Ok(rtt)
}
