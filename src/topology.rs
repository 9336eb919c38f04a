//! # Topology Model
//!
//! Pure data describing which validators exist, where they listen, and which
//! peers each of them must connect to. A [`Topology`] is fetched once per
//! bootstrap from a [`TopologyProvider`] and never mutated locally.
//!
//! ## Invariant
//!
//! `ListenAddr` is the single source of truth for addresses: every
//! [`Validator`] record for peer `p` inside any `Connections[v]` must carry
//! exactly `ListenAddr[p]`. [`Topology::validate`] enforces this.
//!
//! ## Wire Format
//!
//! The JSON encoding uses the provider's field names (`ListenAddr`,
//! `Connections`, `ID`, `PublicKey`, `City`); validator IDs appear as string
//! map keys.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ProviderError, TopologyError};
use crate::identity::Identity;

/// Externally assigned validator index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatorId(pub u32);

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ValidatorId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A required peer, as listed in another validator's connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(rename = "ID")]
    pub id: ValidatorId,
    #[serde(rename = "PublicKey", default)]
    pub public_key: Option<Identity>,
    /// `IP:PORT/IDENTITY`, see [`crate::identity::PeerAddr`].
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,
    #[serde(rename = "City", default, deserialize_with = "empty_as_none")]
    pub locality: Option<String>,
}

impl Validator {
    pub fn new(id: ValidatorId, listen_addr: impl Into<String>) -> Self {
        Self {
            id,
            public_key: None,
            listen_addr: listen_addr.into(),
            locality: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(rename = "ListenAddr", default, deserialize_with = "null_as_default")]
    pub listen_addr: BTreeMap<ValidatorId, String>,
    #[serde(rename = "Connections", default, deserialize_with = "null_as_default")]
    pub connections: BTreeMap<ValidatorId, Vec<Validator>>,
}

impl Topology {
    pub fn listen_addr_of(&self, id: ValidatorId) -> Option<&str> {
        self.listen_addr.get(&id).map(String::as_str)
    }

    /// Peers `id` must connect to, in provider order.
    pub fn connections_of(&self, id: ValidatorId) -> &[Validator] {
        self.connections.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check that every connection entry agrees with `ListenAddr`.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for (of, peers) in &self.connections {
            for peer in peers {
                let expected = self
                    .listen_addr
                    .get(&peer.id)
                    .ok_or(TopologyError::UnknownPeer { of: *of, peer: peer.id })?;
                if *expected != peer.listen_addr {
                    return Err(TopologyError::AddressMismatch {
                        of: *of,
                        peer: peer.id,
                        listed: peer.listen_addr.clone(),
                        expected: expected.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Source of the topology snapshot.
///
/// Production deployments talk to an HTTP service
/// ([`crate::provider::HttpTopologyProvider`]); tests and demos use
/// [`crate::provider::MockTopologyProvider`]. The bootstrap sequence only
/// sees this trait.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Announce `identity` listening on `listen_addr` as validator `id`.
    ///
    /// Idempotent; called once per startup.
    async fn register_validator(
        &self,
        id: ValidatorId,
        identity: Identity,
        listen_addr: SocketAddr,
    ) -> Result<()>;

    /// Fetch the topology. `Ok(None)` means the provider is not ready yet.
    ///
    /// [`ProviderError::Unavailable`] is retried by bootstrap;
    /// [`ProviderError::Malformed`] aborts it.
    async fn get_topology(&self) -> Result<Option<Topology>, ProviderError>;
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}
