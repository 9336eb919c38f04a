//! Node configuration.
//!
//! | Field | Default |
//! |-------|---------|
//! | `provider_endpoint` | `http://localhost:9669` |
//! | `timeouts.provider_poll_interval` | 1s |
//! | `timeouts.provider_deadline` | 20s |
//! | `timeouts.dial_timeout` | 15s |
//! | `timeouts.dial_backoff` | 500ms |
//! | `alive_idle_timeout` | 10s |
//! | `forward_timeout` | 10s |
//! | `max_message_size` | `MAX_MESSAGE_SIZE` (10 MiB) |
//! | `retention` | `PruneOnDisconnect` |

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Keypair;
use crate::messages::MAX_MESSAGE_SIZE;
use crate::peers::PeerRetention;
use crate::provider::DEFAULT_PROVIDER_PORT;
use crate::scope::ResourceLimits;
use crate::topology::ValidatorId;

/// Deadlines for the bootstrap sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootstrapTimeouts {
    pub provider_poll_interval: Duration,
    pub provider_deadline: Duration,
    /// Per-peer connection attempt, including the backoff.
    pub dial_timeout: Duration,
    /// Pause before each connection attempt.
    pub dial_backoff: Duration,
}

impl Default for BootstrapTimeouts {
    fn default() -> Self {
        Self {
            provider_poll_interval: Duration::from_secs(1),
            provider_deadline: Duration::from_secs(20),
            dial_timeout: Duration::from_secs(15),
            dial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct MeshConfig {
    pub listen_addr: SocketAddr,
    pub validator_id: ValidatorId,
    /// Ed25519 seed of the validator's network identity.
    pub secret_key: [u8; 32],
    pub provider_endpoint: String,
    pub timeouts: BootstrapTimeouts,
    pub alive_idle_timeout: Duration,
    pub forward_timeout: Duration,
    /// Must fit within `limits`; checked when the service is built.
    pub max_message_size: usize,
    pub limits: ResourceLimits,
    pub retention: PeerRetention,
}

impl MeshConfig {
    pub fn new(listen_addr: SocketAddr, validator_id: ValidatorId, secret_key: [u8; 32]) -> Self {
        Self {
            listen_addr,
            validator_id,
            secret_key,
            provider_endpoint: format!("http://localhost:{}", DEFAULT_PROVIDER_PORT),
            timeouts: BootstrapTimeouts::default(),
            alive_idle_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
            limits: ResourceLimits::default(),
            retention: PeerRetention::default(),
        }
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_secret_key_bytes(&self.secret_key)
    }
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfig")
            .field("listen_addr", &self.listen_addr)
            .field("validator_id", &self.validator_id)
            .field("secret_key", &"<redacted>")
            .field("provider_endpoint", &self.provider_endpoint)
            .field("timeouts", &self.timeouts)
            .field("alive_idle_timeout", &self.alive_idle_timeout)
            .field("forward_timeout", &self.forward_timeout)
            .field("max_message_size", &self.max_message_size)
            .field("limits", &self.limits)
            .field("retention", &self.retention)
            .finish()
    }
}
