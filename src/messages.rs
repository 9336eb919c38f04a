//! # Wire Messages
//!
//! | Channel | Payload | Framing |
//! |---------|---------|---------|
//! | txs | [`Transactions`] | one bincode batch, stream end delimits |
//! | evt | [`EventPayloads`] | one bincode batch, stream end delimits |
//! | alive | `[u8; ALIVE_SIZE]` | fixed-size blocks echoed verbatim |
//!
//! Every stream starts with a protocol header (`len: u8 || protocol id`)
//! written by the opener; see [`crate::transport`].
//!
//! ## Limits
//!
//! - `MAX_MESSAGE_SIZE`: largest forwarding payload accepted (10 MiB)
//! - All decoding goes through size-limited bincode options

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::topology::ValidatorId;

/// Largest forwarding message, and the reservation size for inbound reads.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Size of one liveness challenge.
pub const ALIVE_SIZE: usize = 32;

/// Longest protocol identifier that fits the one-byte header length.
pub const MAX_PROTOCOL_ID_LEN: usize = u8::MAX as usize;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

pub type Hash = [u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(nonce: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            nonce,
            payload: payload.into(),
        }
    }

    /// `blake3(nonce || payload)`
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&self.payload);
        *hasher.finalize().as_bytes()
    }
}

/// A consensus event as relayed between validators. The mesh never
/// interprets it beyond hashing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub creator: ValidatorId,
    pub seq: u64,
    pub parents: Vec<Hash>,
    pub payload: Vec<u8>,
}

impl EventPayload {
    pub fn new(creator: ValidatorId, seq: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            creator,
            seq,
            parents: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Content address: `blake3(creator || seq || parents || payload)`.
    pub fn id(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.creator.0.to_le_bytes());
        hasher.update(&self.seq.to_le_bytes());
        for parent in &self.parents {
            hasher.update(parent);
        }
        hasher.update(&self.payload);
        *hasher.finalize().as_bytes()
    }
}

pub type Transactions = Vec<Transaction>;
pub type EventPayloads = Vec<EventPayload>;

/// Serialize a batch once for fan-out.
pub fn encode_batch<T: Serialize>(batch: &[T]) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(batch)
}

/// Decode one batch; trailing bytes and oversized length prefixes are rejected.
pub fn decode_batch<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// `len: u8 || protocol`
pub fn encode_protocol_header(protocol: &str) -> anyhow::Result<Vec<u8>> {
    let id = protocol.as_bytes();
    if id.is_empty() || id.len() > MAX_PROTOCOL_ID_LEN {
        anyhow::bail!("invalid protocol id length: {}", id.len());
    }
    let mut header = Vec::with_capacity(1 + id.len());
    header.push(id.len() as u8);
    header.extend_from_slice(id);
    Ok(header)
}
