//! Typed failure classes surfaced to embedders.
//!
//! Internal plumbing uses `anyhow`; the enums here mark the boundaries where a
//! caller needs to tell failures apart (startup aborts, backpressure, ping
//! rounds).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::topology::ValidatorId;

/// Fatal startup failures. None of these are retried by the mesh itself.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to derive network identity: {0:#}")]
    Identity(anyhow::Error),

    #[error("failed to bind {addr}: {reason:#}")]
    Bind {
        addr: SocketAddr,
        reason: anyhow::Error,
    },

    #[error("failed to register validator {id} with topology provider: {reason:#}")]
    Registration {
        id: ValidatorId,
        reason: anyhow::Error,
    },

    #[error("topology provider not ready after {0:?}")]
    ProviderTimeout(Duration),

    #[error("topology provider served an unusable topology: {reason:#}")]
    Topology { reason: anyhow::Error },

    #[error("invalid resource limits: {0}")]
    Limits(#[from] ResourceError),

    #[error("topology is inconsistent: {0}")]
    InvalidTopology(#[from] TopologyError),

    #[error("topology provider lists this node's address as {listed:?}, expected {expected}")]
    SelfMismatch {
        listed: Option<String>,
        expected: String,
    },

    #[error("validator {0} has no configured connections")]
    NoConnections(ValidatorId),

    #[error("invalid address {addr:?} for validator {id}: {reason:#}")]
    InvalidPeerAddress {
        id: ValidatorId,
        addr: String,
        reason: anyhow::Error,
    },

    #[error("failed to connect to validator {id} at {addr}: {reason:#}")]
    Dial {
        id: ValidatorId,
        addr: String,
        reason: anyhow::Error,
    },

    #[error("timed out connecting to validator {id} at {addr}")]
    DialTimeout { id: ValidatorId, addr: String },
}

/// Failure to fetch a topology snapshot from a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider could not be reached or answered the readiness check with
    /// an error. Bootstrap keeps polling.
    #[error("topology provider unavailable: {0:#}")]
    Unavailable(anyhow::Error),

    /// The provider is ready but its topology could not be fetched or decoded.
    #[error("topology provider served an unusable topology: {0:#}")]
    Malformed(anyhow::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Violations of the topology's single-source-of-truth address invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("validator {peer} listed in connections of {of} has no listen address")]
    UnknownPeer { of: ValidatorId, peer: ValidatorId },

    #[error("validator {peer} listed in connections of {of} with address {listed}, expected {expected}")]
    AddressMismatch {
        of: ValidatorId,
        peer: ValidatorId,
        listed: String,
        expected: String,
    },
}

/// Memory reservation refused. Treated as backpressure on one stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("memory limit exceeded: requested {requested} bytes, {reserved}/{limit} reserved")]
    MemoryLimitExceeded {
        requested: usize,
        reserved: usize,
        limit: usize,
    },

    #[error("memory limit of {limit} bytes cannot hold a {required}-byte inbound message")]
    LimitBelowMessageSize { limit: usize, required: usize },

    #[error("service {service} memory limit exceeded: requested {requested} bytes, {reserved}/{limit} reserved")]
    ServiceLimitExceeded {
        service: String,
        requested: usize,
        reserved: usize,
        limit: usize,
    },
}

/// Terminal outcome of one liveness round.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("ping packet was incorrect")]
    PingMismatch,

    #[error("failed to open liveness stream: {0:#}")]
    Stream(anyhow::Error),

    #[error("liveness stream I/O failed: {0:#}")]
    Io(anyhow::Error),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}
