//! Protocol identifiers and the traits at the mesh's seams.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`ValidatorService`] | [`crate::service::MeshService`] | outbound forwarding, dialing |
//! | [`StreamHandler`] | forwarding and liveness handlers | inbound stream per protocol |
//! | [`GossipSink`] | the embedding node | receives decoded batches |
//!
//! The protocol identifiers must match across the mesh; a stream carrying an
//! unknown identifier is reset by the receiver.

use anyhow::Result;
use async_trait::async_trait;

use crate::forward::ForwardReport;
use crate::identity::PeerAddr;
use crate::messages::{EventPayloads, Transactions};
use crate::transport::MeshStream;

/// Logical service scope shared by the three validator protocols.
pub const SERVICE_NAME: &str = "valmesh.validator.service";

pub const VALIDATOR_TXS_PROTOCOL: &str = "/valmesh/validator/txs/1.0.0";
pub const VALIDATOR_EVENTS_PROTOCOL: &str = "/valmesh/validator/evt/1.0.0";
pub const VALIDATOR_ALIVE_PROTOCOL: &str = "/valmesh/validator/alive/1.0.0";

/// Downstream collaborator for decoded inbound batches.
///
/// Calls happen on the stream's task and must not block; implementations
/// queue and return.
pub trait GossipSink: Send + Sync + 'static {
    fn handle_validator_events(&self, events: EventPayloads);

    fn handle_validator_txs(&self, txs: Transactions);
}

/// Handles one inbound stream for a registered protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: MeshStream);
}

/// Validator-to-validator operations exposed to the embedding node.
#[async_trait]
pub trait ValidatorService: Send + Sync {
    /// Best-effort delivery of an event batch to every connected peer.
    async fn forward_events(&self, events: &EventPayloads) -> ForwardReport;

    /// Best-effort delivery of a transaction batch to every connected peer.
    async fn forward_txs(&self, txs: &Transactions) -> ForwardReport;

    /// Dial `peer`, verifying it holds the listed identity.
    async fn connect_to_validator(&self, peer: &PeerAddr) -> Result<()>;
}
