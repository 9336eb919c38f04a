//! # Topology Providers
//!
//! Two implementations of [`TopologyProvider`]:
//!
//! | Provider | Backing | Use |
//! |----------|---------|-----|
//! | [`HttpTopologyProvider`] | remote topology service over HTTP | production |
//! | [`MockTopologyProvider`] | in-process [`TopologyRegistry`] or a fixed snapshot | tests, demos |
//!
//! ## HTTP Contract
//!
//! - `GET /setListenAddrForValidator?id=<id>&listen-addr=<IP:PORT/IDENTITY>` → `201 Created`
//! - `GET /ready` → `200 OK` once the topology is complete
//! - `GET /getTopology` → JSON [`Topology`]
//!
//! ## Registry Semantics
//!
//! Registering validator `v` records `ListenAddr[v]` and links `v` with every
//! validator registered before it, in both directions. After `n`
//! registrations the topology is a full mesh of `n` validators.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::identity::{Identity, PeerAddr};
use crate::topology::{Topology, TopologyProvider, Validator, ValidatorId};

/// Port the reference topology service listens on.
pub const DEFAULT_PROVIDER_PORT: u16 = 9669;

/// Per-request timeout for the HTTP provider.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// HTTP provider
// ============================================================================

#[derive(Clone, Debug)]
pub struct HttpTopologyProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTopologyProvider {
    /// `endpoint` may omit the scheme (`localhost:9669`) and may carry a trailing slash.
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        let trimmed = endpoint.trim().trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TopologyProvider for HttpTopologyProvider {
    async fn register_validator(
        &self,
        id: ValidatorId,
        identity: Identity,
        listen_addr: SocketAddr,
    ) -> Result<()> {
        let self_addr = PeerAddr::new(listen_addr, identity).to_string();
        let resp = self
            .client
            .get(format!("{}/setListenAddrForValidator", self.base_url))
            .query(&[("id", id.to_string()), ("listen-addr", self_addr)])
            .send()
            .await
            .context("registration request failed")?;

        let status = resp.status();
        let body = resp.text().await.context("failed to read registration response")?;
        if status != reqwest::StatusCode::CREATED {
            anyhow::bail!(
                "expected status code {} when setting id on topology, but got {}: {}",
                reqwest::StatusCode::CREATED.as_u16(),
                status.as_u16(),
                body
            );
        }
        Ok(())
    }

    async fn get_topology(&self) -> Result<Option<Topology>, ProviderError> {
        let ready = self
            .client
            .get(format!("{}/ready", self.base_url))
            .send()
            .await
            .context("readiness request failed")
            .map_err(ProviderError::Unavailable)?;
        if ready.status() != reqwest::StatusCode::OK {
            trace!(status = ready.status().as_u16(), "topology provider not ready");
            return Ok(None);
        }

        let resp = self
            .client
            .get(format!("{}/getTopology", self.base_url))
            .send()
            .await
            .context("topology request failed")
            .map_err(ProviderError::Unavailable)?;

        // Past this point the provider claimed readiness: a bad answer is fatal.
        let topology = resp
            .error_for_status()
            .context("topology request rejected")
            .map_err(ProviderError::Malformed)?
            .json::<Topology>()
            .await
            .context("failed to decode topology")
            .map_err(ProviderError::Malformed)?;
        Ok(Some(topology))
    }
}

// ============================================================================
// In-memory registry
// ============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    topology: Topology,
    ready: bool,
    expected: Option<usize>,
}

/// Shared in-memory topology that validators register into.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    state: Mutex<RegistryState>,
}

impl TopologyRegistry {
    /// Registry that only becomes ready through [`set_ready`](Self::set_ready).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry that becomes ready once `validators` distinct IDs registered.
    pub fn expecting(validators: usize) -> Arc<Self> {
        let registry = Self::default();
        registry.lock().expected = Some(validators);
        Arc::new(registry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `listen_addr` for `id`, linking it with every known validator.
    ///
    /// Re-registering an ID updates its address everywhere instead of adding
    /// duplicate links.
    pub fn register(&self, id: ValidatorId, listen_addr: impl Into<String>) {
        let listen_addr = listen_addr.into();
        let mut state = self.lock();
        let topology = &mut state.topology;

        if topology.listen_addr.insert(id, listen_addr.clone()).is_some() {
            for peers in topology.connections.values_mut() {
                for peer in peers.iter_mut().filter(|p| p.id == id) {
                    peer.listen_addr = listen_addr.clone();
                }
            }
        } else {
            let others: Vec<(ValidatorId, String)> = topology
                .listen_addr
                .iter()
                .filter(|(other, _)| **other != id)
                .map(|(other, addr)| (*other, addr.clone()))
                .collect();
            for (other, other_addr) in others {
                topology
                    .connections
                    .entry(other)
                    .or_default()
                    .push(Validator::new(id, listen_addr.clone()));
                topology
                    .connections
                    .entry(id)
                    .or_default()
                    .push(Validator::new(other, other_addr));
            }
        }

        if let Some(expected) = state.expected
            && state.topology.listen_addr.len() >= expected
        {
            state.ready = true;
        }
        debug!(id = %id, nodes = state.topology.listen_addr.len(), "validator registered");
    }

    pub fn set_ready(&self) {
        self.lock().ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn snapshot(&self) -> Topology {
        self.lock().topology.clone()
    }

    pub fn nodes_num(&self) -> usize {
        self.lock().topology.listen_addr.len()
    }

    pub fn validators_for(&self, id: ValidatorId) -> Option<Vec<Validator>> {
        self.lock().topology.connections.get(&id).cloned()
    }

    pub fn listen_addr_for(&self, id: ValidatorId) -> Option<String> {
        self.lock().topology.listen_addr.get(&id).cloned()
    }
}

// ============================================================================
// Mock provider
// ============================================================================

#[derive(Debug)]
enum Source {
    Registry(Arc<TopologyRegistry>),
    Fixed(Topology),
    Unavailable(String),
    Malformed(String),
}

#[derive(Debug)]
pub struct MockTopologyProvider {
    source: Source,
    reject_registration: bool,
    registrations: Mutex<Vec<(ValidatorId, String)>>,
    polls: AtomicUsize,
}

impl MockTopologyProvider {
    /// Provider backed by a shared registry; several validators can share one.
    pub fn new(registry: Arc<TopologyRegistry>) -> Self {
        Self::with_source(Source::Registry(registry))
    }

    /// Provider that is always ready and always serves `topology`.
    /// Registrations are recorded but do not change the snapshot.
    pub fn fixed(topology: Topology) -> Self {
        Self::with_source(Source::Fixed(topology))
    }

    /// Provider whose topology fetch always fails as if unreachable.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_source(Source::Unavailable(reason.into()))
    }

    /// Provider that reports ready but always serves an undecodable topology.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::with_source(Source::Malformed(reason.into()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            reject_registration: false,
            registrations: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }

    /// Make every registration fail.
    pub fn rejecting_registration(mut self) -> Self {
        self.reject_registration = true;
        self
    }

    /// `(id, self identifier)` pairs received so far.
    pub fn registrations(&self) -> Vec<(ValidatorId, String)> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of `get_topology` calls served.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TopologyProvider for MockTopologyProvider {
    async fn register_validator(
        &self,
        id: ValidatorId,
        identity: Identity,
        listen_addr: SocketAddr,
    ) -> Result<()> {
        if self.reject_registration {
            anyhow::bail!("registration rejected by topology provider");
        }
        let self_addr = PeerAddr::new(listen_addr, identity).to_string();
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, self_addr.clone()));
        if let Source::Registry(registry) = &self.source {
            registry.register(id, self_addr);
        }
        Ok(())
    }

    async fn get_topology(&self) -> Result<Option<Topology>, ProviderError> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        match &self.source {
            Source::Registry(registry) if registry.is_ready() => Ok(Some(registry.snapshot())),
            Source::Registry(_) => Ok(None),
            Source::Fixed(topology) => Ok(Some(topology.clone())),
            Source::Unavailable(reason) => Err(ProviderError::Unavailable(anyhow::anyhow!("{reason}"))),
            Source::Malformed(reason) => Err(ProviderError::Malformed(anyhow::anyhow!("{reason}"))),
        }
    }
}
