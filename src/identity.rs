//! # Identity Primitives
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local validator
//! - [`Identity`]: 32-byte public key, the peer's transport-level identifier
//! - [`PeerAddr`]: dialable `IP:PORT/IDENTITY` record
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key**. The same key is embedded into the
//! self-signed TLS certificate used on every QUIC connection, so a peer that
//! completes the handshake has proven possession of the private key behind the
//! identity it advertises in the topology.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - `PeerAddr::from_str(addr.to_string()) == addr`
//! - Only valid Ed25519 points are accepted as certificate identities

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Parse a hex-encoded 32-byte Ed25519 seed.
    pub fn from_secret_key_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s.trim()).context("secret key is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
        Ok(Self::from_secret_key_bytes(&seed))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short prefix used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check if this identity is a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF keys are rejected before the point decoding.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A dialable peer address: `IP:PORT/IDENTITY`.
///
/// This is the self-identifier a validator registers with the topology
/// provider and the form in which peers appear in `Topology::listen_addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub addr: SocketAddr,
    pub identity: Identity,
}

impl PeerAddr {
    pub fn new(addr: SocketAddr, identity: Identity) -> Self {
        Self { addr, identity }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("peer address must include Identity (format: IP:PORT/IDENTITY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let identity = Identity::from_hex(id_part)
            .map_err(|_| anyhow::anyhow!("Identity must be 64 hex characters (32 bytes)"))?;

        Ok(Self { addr, identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_roundtrip() {
        let identity = Keypair::generate().identity();
        let parsed = Identity::from_hex(&identity.to_hex()).unwrap();
        assert_eq!(parsed, identity);
    }

    #[test]
    fn identity_from_hex_rejects_wrong_length() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex(&"00".repeat(33)).is_err());
    }

    #[test]
    fn generated_identity_is_valid() {
        for _ in 0..20 {
            assert!(Keypair::generate().identity().is_valid());
        }
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn keypair_from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = Keypair::from_secret_key_bytes(&seed);
        let b = Keypair::from_secret_key_hex(&hex::encode(seed)).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.secret_key_bytes(), seed);
    }

    #[test]
    fn keypair_from_hex_rejects_short_seed() {
        assert!(Keypair::from_secret_key_hex("0102").is_err());
        assert!(Keypair::from_secret_key_hex("not hex").is_err());
    }

    #[test]
    fn peer_addr_display_parse_roundtrip() {
        let identity = Keypair::generate().identity();
        let addr = PeerAddr::new("127.0.0.1:9000".parse().unwrap(), identity);
        let s = addr.to_string();
        assert!(s.starts_with("127.0.0.1:9000/"));
        assert_eq!(s.parse::<PeerAddr>().unwrap(), addr);
    }

    #[test]
    fn peer_addr_parse_errors() {
        assert!("127.0.0.1:9000".parse::<PeerAddr>().is_err());
        assert!("not-an-addr/00".parse::<PeerAddr>().is_err());
        let bad_id = format!("127.0.0.1:9000/{}", "zz".repeat(32));
        assert!(bad_id.parse::<PeerAddr>().is_err());
    }

    #[test]
    fn peer_addr_ipv6() {
        let identity = Keypair::generate().identity();
        let addr = PeerAddr::new("[::1]:9001".parse().unwrap(), identity);
        assert_eq!(addr.to_string().parse::<PeerAddr>().unwrap(), addr);
    }
}
