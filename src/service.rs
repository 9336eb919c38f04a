//! The validator mesh service: one [`Host`], one [`ResourceManager`], and the
//! three protocol handlers wired to an embedder-supplied [`GossipSink`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MeshConfig;
use crate::error::ResourceError;
use crate::forward::{fan_out, EventsHandler, ForwardReport, TxsHandler};
use crate::identity::{Identity, PeerAddr};
use crate::liveness::{AliveHandler, AliveProbe};
use crate::messages::{encode_batch, EventPayloads, Transactions, MAX_MESSAGE_SIZE};
use crate::protocols::{
    GossipSink, ValidatorService, SERVICE_NAME, VALIDATOR_ALIVE_PROTOCOL,
    VALIDATOR_EVENTS_PROTOCOL, VALIDATOR_TXS_PROTOCOL,
};
use crate::scope::{ResourceLimits, ResourceManager, ServiceScope};
use crate::transport::Host;

/// Tuning for the per-stream protocol behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Deadline for one outbound delivery to one peer.
    pub forward_timeout: Duration,
    /// How long an inbound forwarding stream may take to deliver its message.
    pub read_timeout: Duration,
    /// Responder-side idle timer on liveness streams.
    pub alive_idle_timeout: Duration,
    /// Largest inbound forwarding message; this many bytes are reserved per
    /// inbound stream.
    pub max_message_size: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            alive_idle_timeout: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&MeshConfig> for ServiceSettings {
    fn from(config: &MeshConfig) -> Self {
        Self {
            forward_timeout: config.forward_timeout,
            read_timeout: config.forward_timeout,
            alive_idle_timeout: config.alive_idle_timeout,
            max_message_size: config.max_message_size,
        }
    }
}

pub struct MeshService {
    host: Arc<Host>,
    resources: Arc<ResourceManager>,
    scope: ServiceScope,
    settings: ServiceSettings,
}

impl MeshService {
    /// Register the txs, events, and alive handlers on `host`.
    ///
    /// Fails if `limits` cannot hold one inbound message of
    /// `settings.max_message_size`.
    pub fn new(
        host: Arc<Host>,
        gossip: Arc<dyn GossipSink>,
        limits: ResourceLimits,
        settings: ServiceSettings,
    ) -> Result<Arc<Self>, ResourceError> {
        let max_message_size = settings.max_message_size.min(MAX_MESSAGE_SIZE);
        limits.check_message_size(max_message_size)?;
        let resources = ResourceManager::new(limits);
        let scope = resources.scope(SERVICE_NAME);

        host.set_stream_handler(
            VALIDATOR_TXS_PROTOCOL,
            Arc::new(
                TxsHandler::new(scope.clone(), Arc::clone(&gossip), settings.read_timeout)
                    .with_max_message_size(max_message_size),
            ),
        );
        host.set_stream_handler(
            VALIDATOR_EVENTS_PROTOCOL,
            Arc::new(
                EventsHandler::new(scope.clone(), gossip, settings.read_timeout)
                    .with_max_message_size(max_message_size),
            ),
        );
        host.set_stream_handler(
            VALIDATOR_ALIVE_PROTOCOL,
            Arc::new(AliveHandler::new(scope.clone(), settings.alive_idle_timeout)),
        );

        Ok(Arc::new(Self {
            host,
            resources,
            scope,
            settings,
        }))
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn identity(&self) -> Identity {
        self.host.identity()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn settings(&self) -> ServiceSettings {
        self.settings
    }

    pub fn peer_count(&self) -> usize {
        self.host.peers().len()
    }

    pub async fn forward_txs(&self, txs: &Transactions) -> ForwardReport {
        self.forward(VALIDATOR_TXS_PROTOCOL, encode_batch(txs)).await
    }

    pub async fn forward_events(&self, events: &EventPayloads) -> ForwardReport {
        self.forward(VALIDATOR_EVENTS_PROTOCOL, encode_batch(events)).await
    }

    async fn forward(
        &self,
        protocol: &'static str,
        encoded: Result<Vec<u8>, bincode::Error>,
    ) -> ForwardReport {
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(protocol, error = %e, "failed to encode batch");
                return ForwardReport::default();
            }
        };
        fan_out(
            &self.host,
            &self.scope,
            protocol,
            Arc::new(payload),
            self.settings.forward_timeout,
        )
        .await
    }

    /// Start a liveness probe against a connected peer.
    pub fn alive_validator(&self, peer: Identity, cancel: &CancellationToken) -> AliveProbe {
        debug!(peer = %peer.short(), "starting liveness probe");
        AliveProbe::spawn(Arc::clone(&self.host), self.scope.clone(), peer, cancel)
    }

    pub async fn connect_to_validator(&self, peer: &PeerAddr) -> Result<()> {
        self.host.connect(peer).await?;
        Ok(())
    }
}

#[async_trait]
impl ValidatorService for MeshService {
    async fn forward_events(&self, events: &EventPayloads) -> ForwardReport {
        MeshService::forward_events(self, events).await
    }

    async fn forward_txs(&self, txs: &Transactions) -> ForwardReport {
        MeshService::forward_txs(self, txs).await
    }

    async fn connect_to_validator(&self, peer: &PeerAddr) -> Result<()> {
        MeshService::connect_to_validator(self, peer).await
    }
}

impl std::fmt::Debug for MeshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService")
            .field("host", &self.host)
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::GossipChannel;
    use crate::identity::Keypair;
    use crate::peers::PeerRetention;

    #[tokio::test]
    async fn new_registers_all_protocols() {
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate(), PeerRetention::default())
            .await
            .unwrap();
        let (sink, _rx) = GossipChannel::new(8);
        let service = MeshService::new(
            Arc::clone(&host),
            Arc::new(sink),
            ResourceLimits::default(),
            ServiceSettings::default(),
        )
        .unwrap();

        for protocol in [VALIDATOR_TXS_PROTOCOL, VALIDATOR_EVENTS_PROTOCOL, VALIDATOR_ALIVE_PROTOCOL] {
            assert!(host.has_stream_handler(protocol), "{protocol} not registered");
        }
        assert_eq!(service.identity(), host.identity());
    }

    #[tokio::test]
    async fn forwarding_without_peers_is_a_no_op() {
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate(), PeerRetention::default())
            .await
            .unwrap();
        let (sink, _rx) = GossipChannel::new(8);
        let service =
            MeshService::new(host, Arc::new(sink), ResourceLimits::default(), ServiceSettings::default()).unwrap();

        let report = service.forward_txs(&Vec::new()).await;
        assert_eq!(report, ForwardReport::default());
        assert_eq!(service.resources().stats().acquired_total, 0);
    }

    #[tokio::test]
    async fn limits_below_message_size_are_rejected() {
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate(), PeerRetention::default())
            .await
            .unwrap();
        let (sink, _rx) = GossipChannel::new(8);
        let tight = ResourceLimits {
            total_memory: 1000,
            per_service_memory: 1000,
        };

        let err = MeshService::new(Arc::clone(&host), Arc::new(sink.clone()), tight, ServiceSettings::default())
            .unwrap_err();
        assert_eq!(
            err,
            ResourceError::LimitBelowMessageSize {
                limit: 1000,
                required: MAX_MESSAGE_SIZE,
            }
        );
        assert!(!host.has_stream_handler(VALIDATOR_TXS_PROTOCOL));

        let small_messages = ServiceSettings {
            max_message_size: 1000,
            ..ServiceSettings::default()
        };
        assert!(MeshService::new(host, Arc::new(sink), tight, small_messages).is_ok());
    }
}
