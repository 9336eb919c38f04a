//! # Mesh Bootstrap
//!
//! Startup sequence for one validator. Every step is fatal on failure and
//! nothing is retried here; restarting the node is the recovery path.
//!
//! 1. Bind the QUIC host and register the three protocol handlers
//! 2. Register `(id, IP:PORT/IDENTITY)` with the topology provider
//! 3. Poll the provider every `provider_poll_interval` until it is ready,
//!    giving up after `provider_deadline`. An unreachable provider is polled
//!    again; a ready provider serving an unusable topology aborts at once
//! 4. Check that the provider lists this node under its own address, then
//!    check the topology's address invariant
//! 5. Dial every peer in `Connections[id]`, in provider order, pausing
//!    `dial_backoff` before each attempt and bounding each attempt by
//!    `dial_timeout`
//!
//! ```ignore
//! let service = setup_validator_connections(config, gossip, &provider).await?;
//! service.forward_events(&events).await;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::config::{BootstrapTimeouts, MeshConfig};
use crate::error::{BootstrapError, ProviderError};
use crate::identity::PeerAddr;
use crate::protocols::GossipSink;
use crate::service::{MeshService, ServiceSettings};
use crate::topology::{Topology, TopologyProvider, Validator, ValidatorId};
use crate::transport::Host;

/// A bound but not yet connected validator.
///
/// Splitting bind from [`run`](Self::run) lets callers learn the actual
/// listen address (e.g. after binding port 0) before the provider is
/// contacted.
pub struct Bootstrap {
    config: MeshConfig,
    service: Arc<MeshService>,
}

impl Bootstrap {
    pub async fn bind(config: MeshConfig, gossip: Arc<dyn GossipSink>) -> Result<Self, BootstrapError> {
        let keypair = config.keypair();
        let host = Host::bind(config.listen_addr, &keypair, config.retention)
            .await
            .map_err(|reason| BootstrapError::Bind {
                addr: config.listen_addr,
                reason,
            })?;
        let service = MeshService::new(host, gossip, config.limits, ServiceSettings::from(&config))?;
        Ok(Self { config, service })
    }

    /// The self-identifier registered with the provider.
    pub fn self_addr(&self) -> PeerAddr {
        self.service.host().peer_addr()
    }

    pub fn service(&self) -> &Arc<MeshService> {
        &self.service
    }

    /// Register, fetch and check the topology, then dial every required peer.
    pub async fn run<P>(self, provider: &P) -> Result<Arc<MeshService>, BootstrapError>
    where
        P: TopologyProvider + ?Sized,
    {
        let id = self.config.validator_id;
        let self_addr = self.self_addr();

        provider
            .register_validator(id, self_addr.identity, self_addr.addr)
            .await
            .map_err(|reason| BootstrapError::Registration { id, reason })?;
        info!(id = %id, addr = %self_addr, "registered with topology provider");

        let topology = wait_for_topology(provider, &self.config.timeouts).await?;

        let expected = self_addr.to_string();
        let listed = topology.listen_addr_of(id);
        if listed != Some(expected.as_str()) {
            return Err(BootstrapError::SelfMismatch {
                listed: listed.map(str::to_string),
                expected,
            });
        }
        topology.validate()?;

        let peers = topology.connections_of(id);
        if peers.is_empty() {
            return Err(BootstrapError::NoConnections(id));
        }
        info!(id = %id, peers = peers.len(), "connecting to validators");

        for validator in peers {
            if validator.id == id {
                debug!(id = %id, "skipping self in connections");
                continue;
            }
            dial_validator(&self.service, validator, &self.config.timeouts).await?;
        }

        info!(
            id = %id,
            connected = self.service.peer_count(),
            "validator mesh established"
        );
        Ok(self.service)
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("validator_id", &self.config.validator_id)
            .field("self_addr", &self.self_addr())
            .finish()
    }
}

/// Bind, register, and connect a validator in one call.
pub async fn setup_validator_connections<P>(
    config: MeshConfig,
    gossip: Arc<dyn GossipSink>,
    provider: &P,
) -> Result<Arc<MeshService>, BootstrapError>
where
    P: TopologyProvider + ?Sized,
{
    Bootstrap::bind(config, gossip).await?.run(provider).await
}

async fn wait_for_topology<P>(provider: &P, timeouts: &BootstrapTimeouts) -> Result<Topology, BootstrapError>
where
    P: TopologyProvider + ?Sized,
{
    let poll = async {
        let mut interval = tokio::time::interval(timeouts.provider_poll_interval);
        loop {
            interval.tick().await;
            match provider.get_topology().await {
                Ok(Some(topology)) => return Ok(topology),
                Ok(None) => trace!("topology provider not ready"),
                Err(ProviderError::Unavailable(e)) => {
                    warn!(error = %format!("{e:#}"), "topology provider poll failed")
                }
                Err(ProviderError::Malformed(reason)) => {
                    return Err(BootstrapError::Topology { reason });
                }
            }
        }
    };
    tokio::time::timeout(timeouts.provider_deadline, poll)
        .await
        .map_err(|_| BootstrapError::ProviderTimeout(timeouts.provider_deadline))?
}

/// Turn a topology entry into something dialable.
///
/// Listed addresses are used as-is; this is the hook for deployments that
/// publish addresses in another form.
pub fn resolve_address(validator: &Validator) -> Result<PeerAddr> {
    validator.listen_addr.parse()
}

async fn dial_validator(
    service: &MeshService,
    validator: &Validator,
    timeouts: &BootstrapTimeouts,
) -> Result<(), BootstrapError> {
    let id: ValidatorId = validator.id;
    let peer = resolve_address(validator).map_err(|reason| BootstrapError::InvalidPeerAddress {
        id,
        addr: validator.listen_addr.clone(),
        reason,
    })?;

    let attempt = async {
        tokio::time::sleep(timeouts.dial_backoff).await;
        service.connect_to_validator(&peer).await
    };
    match tokio::time::timeout(timeouts.dial_timeout, attempt).await {
        Ok(Ok(())) => {
            debug!(id = %id, peer = %peer.identity.short(), addr = %peer.addr, "connected to validator");
            Ok(())
        }
        Ok(Err(reason)) => Err(BootstrapError::Dial {
            id,
            addr: validator.listen_addr.clone(),
            reason,
        }),
        Err(_) => Err(BootstrapError::DialTimeout {
            id,
            addr: validator.listen_addr.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::forward::GossipChannel;
    use crate::identity::Keypair;
    use crate::peers::PeerRetention;
    use crate::provider::{MockTopologyProvider, TopologyRegistry};

    fn fast_config(id: u32) -> MeshConfig {
        let mut config = MeshConfig::new("127.0.0.1:0".parse().unwrap(), ValidatorId(id), Keypair::generate().secret_key_bytes());
        config.timeouts = BootstrapTimeouts {
            provider_poll_interval: Duration::from_millis(20),
            provider_deadline: Duration::from_millis(300),
            dial_timeout: Duration::from_secs(5),
            dial_backoff: Duration::from_millis(10),
        };
        config
    }

    fn sink() -> Arc<dyn GossipSink> {
        Arc::new(GossipChannel::new(16).0)
    }

    #[test]
    fn resolve_address_passes_listed_address_through() {
        let identity = Keypair::generate().identity();
        let validator = Validator::new(ValidatorId(2), format!("127.0.0.1:9002/{}", identity));
        let peer = resolve_address(&validator).unwrap();
        assert_eq!(peer.identity, identity);
        assert_eq!(peer.addr, "127.0.0.1:9002".parse().unwrap());

        assert!(resolve_address(&Validator::new(ValidatorId(2), "127.0.0.1:9002")).is_err());
    }

    #[tokio::test]
    async fn registration_failure_is_fatal() {
        let provider = MockTopologyProvider::fixed(Topology::default()).rejecting_registration();
        let err = setup_validator_connections(fast_config(1), sink(), &provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Registration { id: ValidatorId(1), .. }));
        assert_eq!(provider.polls(), 0);
    }

    #[tokio::test]
    async fn provider_never_ready_times_out() {
        let provider = MockTopologyProvider::new(TopologyRegistry::new());
        let bootstrap = Bootstrap::bind(fast_config(1), sink()).await.unwrap();
        let host = Arc::clone(bootstrap.service().host());

        let err = bootstrap.run(&provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::ProviderTimeout(_)));
        assert!(provider.polls() >= 2);
        assert_eq!(host.stats().dial_attempts, 0);
    }

    #[tokio::test]
    async fn lone_validator_has_no_connections() {
        let registry = TopologyRegistry::expecting(1);
        let provider = MockTopologyProvider::new(registry);
        let err = setup_validator_connections(fast_config(4), sink(), &provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::NoConnections(ValidatorId(4))));
    }

    #[tokio::test]
    async fn unparsable_peer_address_is_fatal() {
        let registry = TopologyRegistry::new();
        registry.register(ValidatorId(2), "not-an-address");
        let provider = MockTopologyProvider::new(Arc::clone(&registry));

        let bootstrap = Bootstrap::bind(fast_config(1), sink()).await.unwrap();
        registry.set_ready();
        let err = bootstrap.run(&provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidPeerAddress { id: ValidatorId(2), .. }));
    }

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        let registry = TopologyRegistry::new();
        // Nothing listens here: a bound UDP socket that never answers QUIC.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = PeerAddr::new(silent.local_addr().unwrap(), Keypair::generate().identity());
        registry.register(ValidatorId(2), peer.to_string());
        registry.set_ready();
        let provider = MockTopologyProvider::new(registry);

        let mut config = fast_config(1);
        config.timeouts.dial_timeout = Duration::from_millis(300);
        let err = setup_validator_connections(config, sink(), &provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::DialTimeout { id: ValidatorId(2), .. }));
    }

    #[tokio::test]
    async fn malformed_topology_aborts_without_waiting() {
        let provider = MockTopologyProvider::malformed("failed to decode topology");
        let mut config = fast_config(1);
        config.timeouts.provider_deadline = Duration::from_secs(30);

        let started = tokio::time::Instant::now();
        let err = setup_validator_connections(config, sink(), &provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Topology { .. }));
        assert!(err.to_string().contains("failed to decode topology"));
        assert_eq!(provider.polls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unavailable_provider_is_polled_until_deadline() {
        let provider = MockTopologyProvider::unavailable("connection refused");
        let err = setup_validator_connections(fast_config(1), sink(), &provider).await.unwrap_err();
        assert!(matches!(err, BootstrapError::ProviderTimeout(_)));
        assert!(provider.polls() >= 2);
    }

    #[tokio::test]
    async fn self_entry_in_connections_is_not_dialed() {
        let peer_host = Host::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate(), PeerRetention::default())
            .await
            .unwrap();
        let peer_addr = peer_host.peer_addr().to_string();

        let bootstrap = Bootstrap::bind(fast_config(1), sink()).await.unwrap();
        let self_addr = bootstrap.self_addr().to_string();
        let host = Arc::clone(bootstrap.service().host());

        let mut topology = Topology::default();
        topology.listen_addr.insert(ValidatorId(1), self_addr.clone());
        topology.listen_addr.insert(ValidatorId(2), peer_addr.clone());
        topology.connections.insert(
            ValidatorId(1),
            vec![Validator::new(ValidatorId(1), self_addr), Validator::new(ValidatorId(2), peer_addr)],
        );
        let provider = MockTopologyProvider::fixed(topology);

        let service = bootstrap.run(&provider).await.unwrap();
        assert_eq!(host.stats().dial_attempts, 1);
        assert_eq!(service.peer_count(), 1);
        assert!(service.host().peers().contains(&peer_host.identity()));
    }
}
