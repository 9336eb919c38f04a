//! Integration tests for mesh bootstrap and the forwarding protocol.
//!
//! Every test runs real QUIC hosts on loopback, wired together through the
//! in-memory topology registry.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use valmesh::{
    Bootstrap, BootstrapError, BootstrapTimeouts, EventPayload, GossipChannel, GossipDelivery,
    Identity, Keypair, MeshConfig, MeshService, MockTopologyProvider, PeerRetention, ResourceError,
    ResourceLimits, Topology, TopologyRegistry, Transaction, Validator, ValidatorId, setup_validator_connections,
    VALIDATOR_EVENTS_PROTOCOL,
};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(id: u32, retention: PeerRetention) -> MeshConfig {
    let mut config = MeshConfig::new(
        test_addr().parse().unwrap(),
        ValidatorId(id),
        Keypair::generate().secret_key_bytes(),
    );
    config.timeouts = BootstrapTimeouts {
        provider_poll_interval: Duration::from_millis(20),
        provider_deadline: Duration::from_secs(5),
        dial_timeout: Duration::from_secs(5),
        dial_backoff: Duration::from_millis(10),
    };
    config.retention = retention;
    config
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Mesh {
    services: Vec<Arc<MeshService>>,
    inboxes: Vec<mpsc::Receiver<GossipDelivery>>,
    registry: Arc<TopologyRegistry>,
}

/// Bootstrap `n` validators concurrently against one registry.
async fn full_mesh(n: u32, retention: PeerRetention) -> Mesh {
    full_mesh_with(n, |config| config.retention = retention).await
}

/// Like [`full_mesh`], with `configure` applied to every node's config.
async fn full_mesh_with(n: u32, configure: impl Fn(&mut MeshConfig)) -> Mesh {
    let registry = TopologyRegistry::expecting(n as usize);
    let provider = Arc::new(MockTopologyProvider::new(Arc::clone(&registry)));

    let mut tasks = Vec::new();
    let mut inboxes = Vec::new();
    for id in 1..=n {
        let (sink, rx) = GossipChannel::new(64);
        inboxes.push(rx);
        let provider = Arc::clone(&provider);
        let mut config = test_config(id, PeerRetention::default());
        configure(&mut config);
        tasks.push(tokio::spawn(async move {
            setup_validator_connections(config, Arc::new(sink), provider.as_ref()).await
        }));
    }

    let mut services = Vec::new();
    for task in tasks {
        let service = timeout(TEST_TIMEOUT, task)
            .await
            .expect("bootstrap timed out")
            .expect("bootstrap task panicked")
            .expect("bootstrap failed");
        services.push(service);
    }

    let expected = (n - 1) as usize;
    wait_until(|| services.iter().all(|s| s.peer_count() == expected)).await;

    Mesh {
        services,
        inboxes,
        registry,
    }
}

async fn next_delivery(rx: &mut mpsc::Receiver<GossipDelivery>) -> GossipDelivery {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("delivery timed out")
        .expect("gossip channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<GossipDelivery>) {
    let received = timeout(QUIET_PERIOD, rx.recv()).await;
    assert!(received.is_err(), "unexpected delivery: {:?}", received);
}

fn sample_events(creator: u32) -> Vec<EventPayload> {
    vec![
        EventPayload::new(ValidatorId(creator), 1, b"genesis".to_vec()),
        EventPayload {
            creator: ValidatorId(creator),
            seq: 2,
            parents: vec![[7u8; 32]],
            payload: vec![0x5A; 4096],
        },
    ]
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Three validators form a full mesh; each dials exactly its listed peers.
#[tokio::test]
async fn three_validator_full_mesh() {
    let mesh = full_mesh(3, PeerRetention::default()).await;

    assert_eq!(mesh.registry.nodes_num(), 3);
    for (idx, service) in mesh.services.iter().enumerate() {
        let id = ValidatorId(idx as u32 + 1);
        let listed = mesh.registry.validators_for(id).expect("validator registered");
        assert_eq!(listed.len(), 2);
        assert_eq!(service.peer_count(), 2);
        assert_eq!(service.host().stats().dial_attempts, listed.len() as u64);
        assert_eq!(
            mesh.registry.listen_addr_for(id),
            Some(service.host().peer_addr().to_string())
        );
    }
}

/// A provider listing another address for this node aborts before any dial.
#[tokio::test]
async fn self_address_mismatch_aborts_bootstrap() {
    let stranger = Keypair::generate().identity();
    let peer = Keypair::generate().identity();

    let mut topology = Topology::default();
    topology
        .listen_addr
        .insert(ValidatorId(1), format!("127.0.0.1:1/{}", stranger));
    topology
        .listen_addr
        .insert(ValidatorId(2), format!("127.0.0.1:2/{}", peer));
    topology.connections.insert(
        ValidatorId(1),
        vec![Validator::new(ValidatorId(2), format!("127.0.0.1:2/{}", peer))],
    );
    let provider = MockTopologyProvider::fixed(topology);

    let (sink, _rx) = GossipChannel::new(8);
    let bootstrap = Bootstrap::bind(test_config(1, PeerRetention::default()), Arc::new(sink))
        .await
        .expect("bind failed");
    let host = Arc::clone(bootstrap.service().host());
    let expected = bootstrap.self_addr().to_string();

    let err = bootstrap.run(&provider).await.unwrap_err();
    match err {
        BootstrapError::SelfMismatch { listed, expected: e } => {
            assert_eq!(listed, Some(format!("127.0.0.1:1/{}", stranger)));
            assert_eq!(e, expected);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.stats().dial_attempts, 0);
    assert!(host.peers().is_empty());
}

/// A provider that never becomes ready fails the bootstrap without dialing.
#[tokio::test]
async fn provider_never_ready() {
    let provider = MockTopologyProvider::new(TopologyRegistry::new());
    let mut config = test_config(1, PeerRetention::default());
    config.timeouts.provider_deadline = Duration::from_millis(200);

    let (sink, _rx) = GossipChannel::new(8);
    let bootstrap = Bootstrap::bind(config, Arc::new(sink)).await.expect("bind failed");
    let host = Arc::clone(bootstrap.service().host());

    let err = bootstrap.run(&provider).await.unwrap_err();
    assert!(matches!(err, BootstrapError::ProviderTimeout(d) if d == Duration::from_millis(200)));
    assert_eq!(provider.registrations().len(), 1);
    assert_eq!(host.stats().dial_attempts, 0);
}

/// A topology whose connection entries disagree with `ListenAddr` is rejected.
#[tokio::test]
async fn inconsistent_topology_rejected() {
    let (sink, _rx) = GossipChannel::new(8);
    let bootstrap = Bootstrap::bind(test_config(1, PeerRetention::default()), Arc::new(sink))
        .await
        .expect("bind failed");
    let host = Arc::clone(bootstrap.service().host());
    let peer = Keypair::generate().identity();

    let mut topology = Topology::default();
    topology
        .listen_addr
        .insert(ValidatorId(1), bootstrap.self_addr().to_string());
    topology
        .listen_addr
        .insert(ValidatorId(2), format!("127.0.0.1:2/{}", peer));
    topology.connections.insert(
        ValidatorId(1),
        vec![Validator::new(ValidatorId(2), format!("127.0.0.1:3/{}", peer))],
    );
    let provider = MockTopologyProvider::fixed(topology);

    let err = bootstrap.run(&provider).await.unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidTopology(_)), "unexpected error: {err}");
    assert_eq!(host.stats().dial_attempts, 0);
}

// =============================================================================
// Forwarding
// =============================================================================

/// A forwards an event batch; B and C decode identical content.
#[tokio::test]
async fn event_batch_reaches_every_peer() {
    let mut mesh = full_mesh(3, PeerRetention::default()).await;
    let events = sample_events(1);

    let report = mesh.services[0].forward_events(&events).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 0);

    for inbox in &mut mesh.inboxes[1..] {
        match next_delivery(inbox).await {
            GossipDelivery::Events(received) => {
                assert_eq!(received, events);
                assert_eq!(received[1].id(), events[1].id());
            }
            other => panic!("expected events, got {:?}", other),
        }
    }
    assert_quiet(&mut mesh.inboxes[0]).await;
}

/// Transactions use their own channel and handler.
#[tokio::test]
async fn transactions_are_forwarded() {
    let mut mesh = full_mesh(2, PeerRetention::default()).await;
    let txs = vec![Transaction::new(1, b"pay".to_vec()), Transaction::new(2, b"stake".to_vec())];

    let report = mesh.services[1].forward_txs(&txs).await;
    assert_eq!(report.delivered, 1);

    match next_delivery(&mut mesh.inboxes[0]).await {
        GossipDelivery::Txs(received) => assert_eq!(received, txs),
        other => panic!("expected transactions, got {:?}", other),
    }
}

/// A retained peer without a live connection fails; the others still receive.
#[tokio::test]
async fn dead_peer_does_not_block_others() {
    let mut mesh = full_mesh(3, PeerRetention::Retain).await;
    let a = Arc::clone(&mesh.services[0]);
    let c_id: Identity = mesh.services[2].identity();

    mesh.services[2].host().close();
    wait_until(|| a.host().peers().connection(&c_id).is_none()).await;
    assert!(a.host().peers().contains(&c_id), "retained peer was pruned");

    let events = sample_events(1);
    let report = a.forward_events(&events).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);

    match next_delivery(&mut mesh.inboxes[1]).await {
        GossipDelivery::Events(received) => assert_eq!(received, events),
        other => panic!("expected events, got {:?}", other),
    }
}

/// With the default policy a disconnected peer leaves the forwarding list.
#[tokio::test]
async fn disconnected_peer_is_pruned() {
    let mesh = full_mesh(3, PeerRetention::PruneOnDisconnect).await;
    let a = Arc::clone(&mesh.services[0]);

    mesh.services[2].host().close();
    wait_until(|| a.peer_count() == 1).await;

    let report = a.forward_txs(&vec![Transaction::new(1, Vec::new())]).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
}

/// Malformed payloads are discarded; the channel keeps working.
#[tokio::test]
async fn malformed_payload_is_discarded() {
    let mut mesh = full_mesh(2, PeerRetention::default()).await;
    let a = Arc::clone(&mesh.services[0]);
    let b_id = mesh.services[1].identity();

    let mut stream = a
        .host()
        .new_stream(&b_id, VALIDATOR_EVENTS_PROTOCOL)
        .await
        .expect("open stream");
    stream.write_all(&[0xFF; 13]).await.expect("write");
    stream.finish().expect("finish");
    assert_quiet(&mut mesh.inboxes[1]).await;

    let b = Arc::clone(&mesh.services[1]);
    wait_until(|| {
        let stats = b.resources().stats();
        stats.acquired_total == 1
            && stats.released_total == 1
            && stats.outstanding_reservations == 0
            && stats.reserved_bytes == 0
            && stats.outstanding_buffers == 0
    })
    .await;

    let events = sample_events(1);
    a.forward_events(&events).await;
    match next_delivery(&mut mesh.inboxes[1]).await {
        GossipDelivery::Events(received) => assert_eq!(received, events),
        other => panic!("expected events, got {:?}", other),
    }
}

/// Every reservation made while forwarding is released on both sides.
#[tokio::test]
async fn reservations_return_to_zero() {
    let mut mesh = full_mesh(3, PeerRetention::default()).await;

    for round in 0..5u64 {
        mesh.services[(round % 3) as usize]
            .forward_txs(&vec![Transaction::new(round, vec![1u8; 512])])
            .await;
    }
    for inbox in &mut mesh.inboxes {
        while timeout(QUIET_PERIOD, inbox.recv()).await.is_ok() {}
    }

    wait_until(|| {
        mesh.services.iter().all(|s| {
            let stats = s.resources().stats();
            stats.outstanding_reservations == 0
                && stats.reserved_bytes == 0
                && stats.outstanding_buffers == 0
                && stats.acquired_total == stats.released_total
        })
    })
    .await;
    let total: u64 = mesh.services.iter().map(|s| s.resources().stats().acquired_total).sum();
    // 5 sends to 2 peers each, and one inbound read per delivery.
    assert_eq!(total, 20);
}

/// A send the sender cannot reserve memory for fails that peer only.
#[tokio::test]
async fn sender_reservation_failure_counts_as_failed() {
    const TIGHT: usize = 1000;
    let mut mesh = full_mesh_with(2, |config| {
        if config.validator_id == ValidatorId(1) {
            config.max_message_size = TIGHT;
            config.limits = ResourceLimits {
                total_memory: TIGHT,
                per_service_memory: TIGHT,
            };
        }
    })
    .await;
    let a = Arc::clone(&mesh.services[0]);

    let report = a.forward_txs(&vec![Transaction::new(1, vec![0xAB; 2 * TIGHT])]).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.failed, 1);
    assert_quiet(&mut mesh.inboxes[1]).await;

    let stats = a.resources().stats();
    assert_eq!(stats.outstanding_reservations, 0);
    assert_eq!(stats.reserved_bytes, 0);
    assert_eq!(stats.outstanding_buffers, 0);

    let small = vec![Transaction::new(2, vec![0xCD; 16])];
    let report = a.forward_txs(&small).await;
    assert_eq!(report.delivered, 1);
    match next_delivery(&mut mesh.inboxes[1]).await {
        GossipDelivery::Txs(received) => assert_eq!(received, small),
        other => panic!("expected transactions, got {:?}", other),
    }
}

/// Limits that cannot hold one inbound message stop the node before it registers.
#[tokio::test]
async fn limits_below_message_size_abort_bootstrap() {
    let mut config = test_config(1, PeerRetention::default());
    config.limits = ResourceLimits {
        total_memory: 1000,
        per_service_memory: 1000,
    };
    let provider = MockTopologyProvider::new(TopologyRegistry::new());

    let err = setup_validator_connections(config, Arc::new(GossipChannel::new(1).0), &provider)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Limits(ResourceError::LimitBelowMessageSize { limit: 1000, .. })
    ));
    assert!(provider.registrations().is_empty());
}
