//! # valmesh - Validator Peer Mesh
//!
//! valmesh connects a fixed set of validators into a direct peer mesh driven
//! by an externally supplied topology, and carries three protocols over it:
//!
//! - **Transactions** and **events**: best-effort fan-out of one batch per
//!   stream to every connected validator
//! - **Liveness**: continuous challenge/echo probes measuring round-trip time
//!
//! ## Architecture
//!
//! ```text
//!  TopologyProvider ──► Bootstrap ──► MeshService ──► Host (QUIC, mTLS)
//!   (HTTP / mock)      register        forward_*        PeerStore
//!                      poll, check      alive_*          stream handlers
//!                      dial peers                        │
//!                                                        ▼
//!                                                    GossipSink
//! ```
//!
//! ## Security Model
//!
//! - Every connection uses mutual TLS with self-signed Ed25519 certificates
//! - Identity = public key; dials pin the expected identity through SNI
//! - All stream buffers are reserved against per-service memory limits
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, identities, `IP:PORT/IDENTITY` addresses |
//! | `crypto` | TLS certificate generation and verification |
//! | `topology` | Topology model and the provider trait |
//! | `provider` | HTTP and in-memory topology providers |
//! | `bootstrap` | Startup sequence |
//! | `transport` | QUIC host, stream negotiation |
//! | `peers` | Peer list, retention policy, latency |
//! | `scope` | Memory accounting and pooled buffers |
//! | `forward` | Transactions and events fan-out |
//! | `liveness` | Ping initiator and echo responder |
//! | `service` | `MeshService` tying the protocols together |
//! | `messages` | Wire payloads and codecs |
//! | `protocols` | Protocol identifiers and seam traits |

mod bootstrap;
mod config;
mod crypto;
mod error;
mod forward;
mod identity;
mod liveness;
mod messages;
mod peers;
mod protocols;
mod provider;
mod scope;
mod service;
mod topology;
mod transport;

pub use bootstrap::{resolve_address, setup_validator_connections, Bootstrap};
pub use config::{BootstrapTimeouts, MeshConfig};
pub use error::{BootstrapError, LivenessError, ProviderError, ResourceError, TopologyError};
pub use forward::{EventsHandler, ForwardReport, GossipChannel, GossipDelivery, TxsHandler};
pub use identity::{Identity, Keypair, PeerAddr};
pub use liveness::{AliveHandler, AliveProbe, ProbeState};
pub use messages::{
    decode_batch, encode_batch, EventPayload, EventPayloads, Transaction, Transactions,
    ALIVE_SIZE, MAX_MESSAGE_SIZE,
};
pub use peers::{Direction, LatencyStats, PeerHandle, PeerRetention, PeerStore};
pub use protocols::{
    GossipSink, StreamHandler, ValidatorService, SERVICE_NAME, VALIDATOR_ALIVE_PROTOCOL,
    VALIDATOR_EVENTS_PROTOCOL, VALIDATOR_TXS_PROTOCOL,
};
pub use provider::{HttpTopologyProvider, MockTopologyProvider, TopologyRegistry, DEFAULT_PROVIDER_PORT};
pub use scope::{BufferPool, ResourceLimits, ResourceManager, ResourceStats, ScopedBuffer, ServiceScope};
pub use service::{MeshService, ServiceSettings};
pub use topology::{Topology, TopologyProvider, Validator, ValidatorId};
pub use transport::{Host, HostStats, MeshStream};
