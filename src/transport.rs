//! # QUIC Host
//!
//! One [`Host`] per validator: a QUIC endpoint authenticated with the
//! validator's Ed25519 identity, a [`PeerStore`] of live connections, and a
//! table of [`StreamHandler`]s keyed by protocol identifier.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────┐
//!  dial ───► │           Host           │ ◄─── inbound QUIC
//!            │  Endpoint │ PeerStore    │
//!            └─────┬────────────────────┘
//!                  │ one task per connection (accept_bi loop)
//!                  ▼
//!        protocol header ──► StreamHandler (one task per stream)
//! ```
//!
//! ## Stream Negotiation
//!
//! The opener writes `len: u8 || protocol id` before any payload. The
//! receiver reads the header within `HEADER_READ_TIMEOUT`, then hands the
//! stream to the matching handler. Streams for unregistered protocols are
//! reset and counted as rejected.
//!
//! ## Identity
//!
//! Outbound dials pin the expected identity through SNI; inbound peers are
//! identified from their client certificate. A connection whose certificate
//! key differs from the dialed identity is closed before use.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, VarInt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity, generate_ed25519_cert,
    identity_to_sni,
};
use crate::identity::{Identity, Keypair, PeerAddr};
use crate::messages::{encode_protocol_header, MAX_PROTOCOL_ID_LEN};
use crate::peers::{Direction, PeerHandle, PeerRetention, PeerStore};
use crate::protocols::StreamHandler;

/// Time allowed for an inbound stream to announce its protocol.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Application error code used when a stream is abandoned.
const STREAM_RESET_CODE: VarInt = VarInt::from_u32(1);

/// Application error code for streams carrying an unknown protocol.
const STREAM_REJECTED_CODE: VarInt = VarInt::from_u32(2);

const CONNECTION_CLOSE_CODE: VarInt = VarInt::from_u32(0);

#[derive(Debug, Default)]
struct HostMetrics {
    dial_attempts: AtomicU64,
    connections: AtomicU64,
    inbound_connections: AtomicU64,
    streams_opened: AtomicU64,
    streams_accepted: AtomicU64,
    streams_rejected: AtomicU64,
}

/// Counters since the host was bound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub dial_attempts: u64,
    pub connections: u64,
    pub inbound_connections: u64,
    pub streams_opened: u64,
    pub streams_accepted: u64,
    pub streams_rejected: u64,
}

struct Shared {
    identity: Identity,
    peers: PeerStore,
    handlers: StdRwLock<HashMap<String, Arc<dyn StreamHandler>>>,
    metrics: HostMetrics,
}

pub struct Host {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Host {
    /// Bind a QUIC endpoint on `addr` and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        keypair: &Keypair,
        retention: PeerRetention,
    ) -> Result<Arc<Self>> {
        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;
        let local_addr = endpoint.local_addr().context("failed to read bound address")?;

        let shared = Arc::new(Shared {
            identity: keypair.identity(),
            peers: PeerStore::new(retention),
            handlers: StdRwLock::new(HashMap::new()),
            metrics: HostMetrics::default(),
        });

        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), Arc::clone(&shared)));

        info!(
            addr = %local_addr,
            identity = %shared.identity.short(),
            "host listening"
        );

        Ok(Arc::new(Self {
            shared,
            endpoint,
            client_config,
            local_addr,
            accept_task,
        }))
    }

    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `IP:PORT/IDENTITY` for the bound endpoint.
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr::new(self.local_addr, self.shared.identity)
    }

    pub fn peers(&self) -> &PeerStore {
        &self.shared.peers
    }

    pub fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(protocol.to_string(), handler);
        debug!(protocol, "stream handler registered");
    }

    pub fn has_stream_handler(&self, protocol: &str) -> bool {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(protocol)
    }

    /// Connect to `peer`, reusing a live connection when one exists.
    pub async fn connect(&self, peer: &PeerAddr) -> Result<Connection> {
        self.shared.metrics.dial_attempts.fetch_add(1, Ordering::Relaxed);

        if peer.identity == self.shared.identity {
            anyhow::bail!("refusing to dial own identity");
        }
        if let Some(existing) = self.shared.peers.connection(&peer.identity) {
            trace!(peer = %peer.identity.short(), "reusing live connection");
            return Ok(existing);
        }

        let sni = identity_to_sni(&peer.identity);
        debug!(addr = %peer.addr, peer = %peer.identity.short(), "dialing");
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), peer.addr, &sni)
            .with_context(|| format!("failed to initiate connection to {}", peer.addr))?;
        let connection = connecting
            .await
            .with_context(|| format!("failed to establish connection to {}", peer.addr))?;

        let Some(verified) = extract_verified_identity(&connection) else {
            connection.close(CONNECTION_CLOSE_CODE, b"unverified identity");
            anyhow::bail!("could not verify identity of {}", peer.addr);
        };
        if verified != peer.identity {
            connection.close(CONNECTION_CLOSE_CODE, b"identity mismatch");
            anyhow::bail!(
                "peer at {} presented identity {}, expected {}",
                peer.addr,
                verified.short(),
                peer.identity.short()
            );
        }

        attach(&self.shared, verified, connection.clone(), Direction::Outbound);
        Ok(connection)
    }

    /// Close every connection to `identity`.
    pub fn disconnect(&self, identity: &Identity) {
        if let Some(peer) = self
            .shared
            .peers
            .snapshot()
            .into_iter()
            .find(|p| p.identity == *identity)
            && let Some(connection) = peer.connection
        {
            connection.close(CONNECTION_CLOSE_CODE, b"disconnect");
        }
    }

    /// Open a stream to a connected peer and announce `protocol`.
    pub async fn new_stream(&self, peer: &Identity, protocol: &str) -> Result<MeshStream> {
        let connection = self
            .shared
            .peers
            .connection(peer)
            .with_context(|| format!("no live connection to {}", peer.short()))?;
        self.open_on(&connection, *peer, protocol).await
    }

    /// Like [`new_stream`](Self::new_stream) but uses the connection captured
    /// in a snapshot handle.
    pub async fn open_stream(&self, peer: &PeerHandle, protocol: &str) -> Result<MeshStream> {
        let connection = peer
            .connection
            .as_ref()
            .with_context(|| format!("no live connection to {}", peer.identity.short()))?;
        self.open_on(connection, peer.identity, protocol).await
    }

    async fn open_on(
        &self,
        connection: &Connection,
        peer: Identity,
        protocol: &str,
    ) -> Result<MeshStream> {
        let header = encode_protocol_header(protocol)?;
        let (mut send, recv) = connection
            .open_bi()
            .await
            .context("failed to open bidirectional stream")?;
        if let Err(e) = send.write_all(&header).await {
            let _ = send.reset(STREAM_RESET_CODE);
            return Err(e).context("failed to write protocol header");
        }
        self.shared.metrics.streams_opened.fetch_add(1, Ordering::Relaxed);
        trace!(peer = %peer.short(), protocol, "stream opened");
        Ok(MeshStream::new(peer, protocol.to_string(), send, recv))
    }

    pub fn stats(&self) -> HostStats {
        let m = &self.shared.metrics;
        HostStats {
            dial_attempts: m.dial_attempts.load(Ordering::Relaxed),
            connections: m.connections.load(Ordering::Relaxed),
            inbound_connections: m.inbound_connections.load(Ordering::Relaxed),
            streams_opened: m.streams_opened.load(Ordering::Relaxed),
            streams_accepted: m.streams_accepted.load(Ordering::Relaxed),
            streams_rejected: m.streams_rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.accept_task.abort();
        self.endpoint.close(CONNECTION_CLOSE_CODE, b"shutdown");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("identity", &self.shared.identity)
            .field("local_addr", &self.local_addr)
            .field("peers", &self.shared.peers.len())
            .finish()
    }
}

async fn accept_loop(endpoint: Endpoint, shared: Arc<Shared>) {
    while let Some(incoming) = endpoint.accept().await {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = accept_connection(shared, incoming).await {
                debug!(error = %e, "inbound connection failed");
            }
        });
    }
    debug!("accept loop finished");
}

async fn accept_connection(shared: Arc<Shared>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(identity) = extract_verified_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
        connection.close(CONNECTION_CLOSE_CODE, b"unverified identity");
        anyhow::bail!("could not verify peer identity from certificate");
    };

    shared.metrics.inbound_connections.fetch_add(1, Ordering::Relaxed);
    attach(&shared, identity, connection, Direction::Inbound);
    Ok(())
}

/// Track `connection` and serve the streams the peer opens on it.
fn attach(shared: &Arc<Shared>, identity: Identity, connection: Connection, direction: Direction) {
    let remote = connection.remote_address();
    shared.metrics.connections.fetch_add(1, Ordering::Relaxed);
    if shared.peers.add(identity, remote, direction, connection.clone()) {
        info!(peer = %identity.short(), addr = %remote, ?direction, "peer connected");
    }
    tokio::spawn(serve_connection(Arc::clone(shared), identity, connection));
}

async fn serve_connection(shared: Arc<Shared>, identity: Identity, connection: Connection) {
    let remote = connection.remote_address();
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(peer = %identity.short(), remote = %remote, "connection closed");
                break;
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(peer = %identity.short(), remote = %remote, "connection idle timeout");
                break;
            }
            Err(e) => {
                debug!(peer = %identity.short(), remote = %remote, error = %e, "connection lost");
                break;
            }
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(dispatch_stream(shared, identity, send, recv));
    }

    if shared.peers.remove_connection(&identity, connection.stable_id()) {
        info!(peer = %identity.short(), "peer disconnected");
    }
}

async fn dispatch_stream(shared: Arc<Shared>, peer: Identity, mut send: SendStream, mut recv: RecvStream) {
    let protocol = match tokio::time::timeout(HEADER_READ_TIMEOUT, read_protocol_header(&mut recv)).await {
        Ok(Ok(protocol)) => protocol,
        Ok(Err(e)) => {
            debug!(peer = %peer.short(), error = %e, "invalid stream header");
            let _ = send.reset(STREAM_REJECTED_CODE);
            let _ = recv.stop(STREAM_REJECTED_CODE);
            return;
        }
        Err(_) => {
            debug!(peer = %peer.short(), "stream header read timed out");
            let _ = send.reset(STREAM_REJECTED_CODE);
            let _ = recv.stop(STREAM_REJECTED_CODE);
            return;
        }
    };

    let handler = shared
        .handlers
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&protocol)
        .cloned();
    let Some(handler) = handler else {
        shared.metrics.streams_rejected.fetch_add(1, Ordering::Relaxed);
        warn!(peer = %peer.short(), protocol = %protocol, "rejecting stream for unknown protocol");
        let _ = send.reset(STREAM_REJECTED_CODE);
        let _ = recv.stop(STREAM_REJECTED_CODE);
        return;
    };

    shared.metrics.streams_accepted.fetch_add(1, Ordering::Relaxed);
    trace!(peer = %peer.short(), protocol = %protocol, "stream accepted");
    handler.handle(MeshStream::new(peer, protocol, send, recv)).await;
}

async fn read_protocol_header(recv: &mut RecvStream) -> Result<String> {
    let mut len = [0u8; 1];
    recv.read_exact(&mut len).await.context("failed to read header length")?;
    let len = len[0] as usize;
    if len == 0 || len > MAX_PROTOCOL_ID_LEN {
        anyhow::bail!("invalid protocol id length {}", len);
    }
    let mut id = vec![0u8; len];
    recv.read_exact(&mut id).await.context("failed to read protocol id")?;
    String::from_utf8(id).context("protocol id is not UTF-8")
}

// ============================================================================
// Streams
// ============================================================================

/// A bidirectional stream bound to one peer and one protocol.
///
/// Dropping a stream that was neither finished nor closed resets it, so the
/// peer observes an error instead of a clean end of message.
pub struct MeshStream {
    peer: Identity,
    protocol: String,
    send: SendStream,
    recv: RecvStream,
    done: bool,
}

impl MeshStream {
    fn new(peer: Identity, protocol: String, send: SendStream, recv: RecvStream) -> Self {
        Self {
            peer,
            protocol,
            send,
            recv,
            done: false,
        }
    }

    pub fn peer(&self) -> Identity {
        self.peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.send.write_all(buf).await.context("stream write failed")?;
        Ok(())
    }

    /// Signal end of message. No further writes are possible.
    pub fn finish(&mut self) -> Result<()> {
        self.send.finish().context("failed to finish stream")?;
        self.done = true;
        Ok(())
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.recv.read_exact(buf).await.context("stream read failed")?;
        Ok(())
    }

    /// Read until the peer finishes its side. Fails if the message does not
    /// fit in `buf`. Returns the message length.
    pub async fn read_to_end_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv.read(&mut buf[filled..]).await.context("stream read failed")? {
                Some(n) => filled += n,
                None => return Ok(filled),
            }
        }
        let mut probe = [0u8; 1];
        match self.recv.read(&mut probe).await.context("stream read failed")? {
            None => Ok(filled),
            Some(_) => anyhow::bail!("message exceeds {} bytes", buf.len()),
        }
    }

    /// Abort both directions; the peer sees a stream error.
    pub fn reset(&mut self) {
        let _ = self.send.reset(STREAM_RESET_CODE);
        let _ = self.recv.stop(STREAM_RESET_CODE);
        self.done = true;
    }

    /// Finish the send side and stop reading.
    pub fn close(&mut self) {
        let _ = self.send.finish();
        let _ = self.recv.stop(VarInt::from_u32(0));
        self.done = true;
    }
}

impl Drop for MeshStream {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.send.reset(STREAM_RESET_CODE);
            let _ = self.recv.stop(STREAM_RESET_CODE);
        }
    }
}

impl std::fmt::Debug for MeshStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("done", &self.done)
            .finish()
    }
}
